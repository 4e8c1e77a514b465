//! Inner-loop adapter: task-local gradient descent on fast weights.
//!
//! Starting from the shared initial parameters, the adapter takes `K`
//! plain gradient steps on the context loss, evaluating the model on the
//! target inputs after every step:
//!
//! ```text
//! snapshot[0] = P0
//! snapshot[k] = snapshot[k-1] - α · ∇ context_loss(snapshot[k-1])
//! output[k]   = f(x_target; snapshot[k])        k = 0..=K
//! ```
//!
//! Each inner gradient is read through a zero-valued tap [`Var`] added
//! to the snapshot, since candle only keeps gradients for variables. In
//! second-order mode the gradients stay attached to the graph, so a later
//! backward pass from a query loss reaches `P0` through every inner step.

use std::cell::Cell;
use std::sync::{Arc, Once};

use candle_core::{Device, Tensor, Var};
use maml_core::{MamlError, Result};
use maml_nn::{FastWeights, ParamFn, TaskKind};
use serde::{Deserialize, Serialize};

static HIGHER_ORDER_GRADS: Once = Once::new();

thread_local! {
    static GRAPH_KEPT: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Makes candle keep the graph of every gradient it computes.
///
/// Read by candle once per thread on its first backward pass, so this runs
/// before any adapter exists. A thread that ran a backward pass earlier
/// keeps detaching; [`ensure_higher_order_grads`] catches that.
fn enable_higher_order_grads() {
    HIGHER_ORDER_GRADS.call_once(|| {
        std::env::set_var("CANDLE_GRAD_DO_NOT_DETACH", "1");
    });
}

/// Differentiates `x⁴` twice at `x = 1`. The exact value is 12; a backward
/// pass that detaches intermediate gradients yields 4.
fn grads_keep_graph() -> candle_core::Result<bool> {
    let x = Var::new(1f32, &Device::Cpu)?;
    let y = x.as_tensor().sqr()?.sqr()?;
    let first = y.backward()?;
    let Some(dx) = first.get(x.as_tensor()) else {
        return Ok(false);
    };
    let second = dx.backward()?;
    match second.get(x.as_tensor()) {
        Some(d2x) => Ok((d2x.to_scalar::<f32>()? - 12.0).abs() < 1e-3),
        None => Ok(false),
    }
}

/// Checks, once per thread, that candle differentiates through gradients.
///
/// # Errors
///
/// Returns [`MamlError::Internal`] if this thread's backward passes detach
/// gradients, which would silently turn second-order meta-gradients into
/// first-order ones.
pub fn ensure_higher_order_grads() -> Result<()> {
    let kept = match GRAPH_KEPT.with(Cell::get) {
        Some(kept) => kept,
        None => {
            let kept = grads_keep_graph().map_err(|e| MamlError::Internal {
                message: format!("second-order self-check: {e}"),
            })?;
            GRAPH_KEPT.with(|cell| cell.set(Some(kept)));
            kept
        }
    };
    if kept {
        Ok(())
    } else {
        Err(MamlError::Internal {
            message: "second-order gradients unavailable: this thread ran a candle backward \
                      pass before CANDLE_GRAD_DO_NOT_DETACH was set"
                .to_string(),
        })
    }
}

/// Inner-loop hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InnerLoopConfig {
    /// Inner step size α.
    pub alpha: f32,
    /// Step whose query loss drives the meta-update.
    pub inner_iters: usize,
    /// Steps unrolled for diagnostics; the unroll length is
    /// `max(inner_iters, eval_iters)`.
    pub eval_iters: usize,
    /// Drop the second-order terms of the meta-gradient (FOMAML).
    pub first_order: bool,
}

impl Default for InnerLoopConfig {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            inner_iters: 1,
            eval_iters: 3,
            first_order: false,
        }
    }
}

impl InnerLoopConfig {
    /// Number of unrolled steps `K`.
    pub fn max_steps(&self) -> usize {
        self.inner_iters.max(self.eval_iters)
    }

    /// Checks that α is a usable step size.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::InvalidConfig`] if α is negative or not finite.
    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(MamlError::InvalidConfig {
                message: format!("inner step size must be finite and >= 0, got {}", self.alpha),
            });
        }
        Ok(())
    }
}

/// How inner gradients relate to the autograd graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradMode {
    /// Inner gradients stay attached: exact MAML meta-gradients.
    SecondOrder,
    /// Inner gradients are detached; snapshots still depend on `P0`.
    FirstOrder,
    /// Every snapshot is detached. Same numbers, no graph kept.
    Detached,
}

impl GradMode {
    fn keeps_grad_graph(self) -> bool {
        matches!(self, Self::SecondOrder)
    }
}

/// The result of one inner-loop unroll.
///
/// Index 0 of every vector is the pre-adaptation state.
#[derive(Debug, Clone)]
pub struct Unroll {
    /// Parameter snapshots `0..=n`.
    pub snapshots: Vec<FastWeights>,
    /// Raw model outputs on the target inputs, one per snapshot.
    pub outputs: Vec<Tensor>,
    /// Outputs after the task kind's transform (softmax or identity).
    pub predictions: Vec<Tensor>,
}

impl Unroll {
    /// Number of inner steps taken.
    pub fn steps(&self) -> usize {
        self.outputs.len().saturating_sub(1)
    }

    /// Raw target output after `step` inner steps.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::StepOutOfRange`] past the unrolled length.
    pub fn output(&self, step: usize) -> Result<&Tensor> {
        self.outputs.get(step).ok_or(MamlError::StepOutOfRange {
            step,
            max: self.steps(),
        })
    }

    /// Transformed target prediction after `step` inner steps.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::StepOutOfRange`] past the unrolled length.
    pub fn prediction(&self, step: usize) -> Result<&Tensor> {
        self.predictions.get(step).ok_or(MamlError::StepOutOfRange {
            step,
            max: self.steps(),
        })
    }
}

/// Context and target inputs for one unroll.
#[derive(Debug, Clone, Copy)]
pub struct AdaptInputs<'a> {
    /// Context inputs.
    pub x_c: &'a Tensor,
    /// Context labels.
    pub y_c: &'a Tensor,
    /// Target inputs.
    pub x_t: &'a Tensor,
}

/// Runs the inner loop of one task.
#[derive(Clone)]
pub struct InnerLoop {
    model: Arc<dyn ParamFn>,
    kind: TaskKind,
    config: InnerLoopConfig,
}

impl std::fmt::Debug for InnerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerLoop")
            .field("model", &self.model.prefix())
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish()
    }
}

impl InnerLoop {
    /// Creates an adapter for `model` under task kind `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::InvalidConfig`] if α is negative or not finite.
    pub fn new(model: Arc<dyn ParamFn>, kind: TaskKind, config: InnerLoopConfig) -> Result<Self> {
        config.validate()?;
        enable_higher_order_grads();
        Ok(Self {
            model,
            kind,
            config,
        })
    }

    /// The model function being adapted.
    pub fn model(&self) -> &Arc<dyn ParamFn> {
        &self.model
    }

    /// The task kind (loss, transform, metrics).
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// The hyperparameters.
    pub fn config(&self) -> &InnerLoopConfig {
        &self.config
    }

    /// Number of unrolled steps `K`.
    pub fn max_steps(&self) -> usize {
        self.config.max_steps()
    }

    /// The step whose query loss is trained on.
    pub fn pinned_step(&self) -> usize {
        self.config.inner_iters
    }

    /// Gradient mode used when computing meta-gradients.
    pub fn training_mode(&self) -> GradMode {
        if self.config.first_order {
            GradMode::FirstOrder
        } else {
            GradMode::SecondOrder
        }
    }

    /// Unrolls all `K` steps.
    ///
    /// # Errors
    ///
    /// Returns model, loss or tensor errors from any step.
    pub fn adapt(&self, base: &FastWeights, inputs: AdaptInputs<'_>, mode: GradMode) -> Result<Unroll> {
        self.adapt_until(base, inputs, self.max_steps(), mode)
    }

    /// Unrolls only the first `steps` steps.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::StepOutOfRange`] if `steps > K`,
    /// [`MamlError::Internal`] if second-order mode is requested on a thread
    /// whose gradients are detached, or model, loss or tensor errors from
    /// any step.
    pub fn adapt_until(
        &self,
        base: &FastWeights,
        inputs: AdaptInputs<'_>,
        steps: usize,
        mode: GradMode,
    ) -> Result<Unroll> {
        if steps > self.max_steps() {
            return Err(MamlError::StepOutOfRange {
                step: steps,
                max: self.max_steps(),
            });
        }
        if mode.keeps_grad_graph() {
            ensure_higher_order_grads()?;
        }
        let start = match mode {
            GradMode::Detached => {
                FastWeights::new(base.tensors().iter().map(Tensor::detach).collect())
            }
            _ => base.clone(),
        };

        let mut snapshots = Vec::with_capacity(steps + 1);
        let mut outputs = Vec::with_capacity(steps + 1);
        let mut predictions = Vec::with_capacity(steps + 1);

        let out = self.model.apply(inputs.x_t, start.tensors())?;
        predictions.push(self.kind.transform(&out)?);
        outputs.push(out);
        snapshots.push(start);

        for k in 1..=steps {
            let next = self.step(&snapshots[k - 1], inputs.x_c, inputs.y_c, mode)?;
            let out = self.model.apply(inputs.x_t, next.tensors())?;
            predictions.push(self.kind.transform(&out)?);
            outputs.push(out);
            snapshots.push(next);
        }

        Ok(Unroll {
            snapshots,
            outputs,
            predictions,
        })
    }

    /// One gradient step on the context loss.
    fn step(&self, current: &FastWeights, x_c: &Tensor, y_c: &Tensor, mode: GradMode) -> Result<FastWeights> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("inner step: {e}"),
        };

        let taps = current
            .tensors()
            .iter()
            .map(|t| Var::zeros(t.dims(), t.dtype(), t.device()))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_err)?;
        let tapped = current
            .tensors()
            .iter()
            .zip(&taps)
            .map(|(t, p)| t.add(p.as_tensor()))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_err)?;

        let out = self.model.apply(x_c, &tapped)?;
        let loss = self.kind.loss(y_c, &out)?;
        let grads = loss.backward().map_err(map_err)?;

        let alpha = f64::from(self.config.alpha);
        let mut next = Vec::with_capacity(tapped.len());
        for (p, tap) in tapped.iter().zip(&taps) {
            let g = match grads.get(tap.as_tensor()) {
                Some(g) if mode.keeps_grad_graph() => g.clone(),
                Some(g) => g.detach(),
                None => p.zeros_like().map_err(map_err)?,
            };
            let updated = g.affine(alpha, 0.0).and_then(|d| p.sub(&d)).map_err(map_err)?;
            next.push(match mode {
                GradMode::Detached => updated.detach(),
                _ => updated,
            });
        }
        Ok(FastWeights::new(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use maml_core::NameCounters;
    use maml_nn::{Activation, Mlp, MlpConfig, ParamBuilder, ParamList};

    fn setup(alpha: f32) -> (InnerLoop, ParamList, Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        let model: Arc<dyn ParamFn> = Arc::new(Mlp::new(MlpConfig {
            hidden: vec![8],
            num_outputs: 1,
            activation: Activation::Tanh,
        }));
        let x_c = Tensor::new(&[[-1.0f32], [0.0], [1.0], [2.0]], &device).unwrap();
        let y_c = Tensor::new(&[0.5f32, -0.5, 1.0, 2.0], &device).unwrap();
        let x_t = Tensor::new(&[[0.5f32], [1.5]], &device).unwrap();
        let mut counters = NameCounters::new();
        let (_, params) = model
            .create(&x_c, ParamBuilder::new(&mut counters, 7, &device))
            .unwrap();
        let inner = InnerLoop::new(
            model,
            TaskKind::Regression,
            InnerLoopConfig {
                alpha,
                inner_iters: 1,
                eval_iters: 3,
                first_order: false,
            },
        )
        .unwrap();
        (inner, params, x_c, y_c, x_t)
    }

    #[test]
    fn unroll_has_k_plus_one_entries() {
        let (inner, params, x_c, y_c, x_t) = setup(0.1);
        let inputs = AdaptInputs { x_c: &x_c, y_c: &y_c, x_t: &x_t };
        let unroll = inner.adapt(&params.initial_weights(), inputs, GradMode::Detached).unwrap();
        assert_eq!(unroll.steps(), 3);
        assert_eq!(unroll.outputs.len(), 4);
        assert_eq!(unroll.snapshots.len(), 4);
        for snap in &unroll.snapshots {
            assert_eq!(snap.shapes(), params.shapes());
        }
    }

    #[test]
    fn inner_steps_reduce_context_loss() {
        let (inner, params, x_c, y_c, x_t) = setup(0.02);
        let inputs = AdaptInputs { x_c: &x_c, y_c: &y_c, x_t: &x_t };
        let unroll = inner.adapt(&params.initial_weights(), inputs, GradMode::Detached).unwrap();
        let loss_at = |k: usize| {
            let out = inner.model().apply(&x_c, unroll.snapshots[k].tensors()).unwrap();
            TaskKind::Regression.loss(&y_c, &out).unwrap().to_scalar::<f32>().unwrap()
        };
        assert!(loss_at(1) < loss_at(0));
        assert!(loss_at(3) < loss_at(1));
    }

    #[test]
    fn adapt_until_stops_early() {
        let (inner, params, x_c, y_c, x_t) = setup(0.1);
        let inputs = AdaptInputs { x_c: &x_c, y_c: &y_c, x_t: &x_t };
        let unroll = inner
            .adapt_until(&params.initial_weights(), inputs, 1, GradMode::Detached)
            .unwrap();
        assert_eq!(unroll.steps(), 1);
        assert!(matches!(
            unroll.output(2),
            Err(MamlError::StepOutOfRange { step: 2, max: 1 })
        ));
        let err = inner
            .adapt_until(&params.initial_weights(), inputs, 4, GradMode::Detached)
            .unwrap_err();
        assert!(matches!(err, MamlError::StepOutOfRange { step: 4, max: 3 }));
    }

    #[test]
    fn adapting_leaves_initial_parameters_untouched() {
        let (inner, params, x_c, y_c, x_t) = setup(0.5);
        let before = params.to_host().unwrap();
        let inputs = AdaptInputs { x_c: &x_c, y_c: &y_c, x_t: &x_t };
        inner
            .adapt(&params.initial_weights(), inputs, GradMode::SecondOrder)
            .unwrap();
        assert_eq!(params.to_host().unwrap(), before);
    }

    #[test]
    fn negative_alpha_is_rejected() {
        let config = InnerLoopConfig {
            alpha: -0.1,
            ..InnerLoopConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn first_order_mode_matches_forward_values() {
        let (inner, params, x_c, y_c, x_t) = setup(0.1);
        let inputs = AdaptInputs { x_c: &x_c, y_c: &y_c, x_t: &x_t };
        let base = params.initial_weights();
        let a = inner.adapt(&base, inputs, GradMode::SecondOrder).unwrap();
        let b = inner.adapt(&base, inputs, GradMode::FirstOrder).unwrap();
        let c = inner.adapt(&base, inputs, GradMode::Detached).unwrap();
        let va = a.outputs[3].to_vec1::<f32>().unwrap();
        let vb = b.outputs[3].to_vec1::<f32>().unwrap();
        let vc = c.outputs[3].to_vec1::<f32>().unwrap();
        for ((x, y), z) in va.iter().zip(&vb).zip(&vc) {
            assert!((x - y).abs() < 1e-5);
            assert!((x - z).abs() < 1e-5);
        }
    }

    #[test]
    fn fresh_threads_pass_the_second_order_check() {
        enable_higher_order_grads();
        let handle = std::thread::spawn(|| {
            let check = ensure_higher_order_grads();
            let (inner, params, x_c, y_c, x_t) = setup(0.1);
            let inputs = AdaptInputs { x_c: &x_c, y_c: &y_c, x_t: &x_t };
            let unroll = inner.adapt(&params.initial_weights(), inputs, GradMode::SecondOrder);
            (check.is_ok(), unroll.is_ok())
        });
        assert_eq!(handle.join().unwrap(), (true, true));
    }
}

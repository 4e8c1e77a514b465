//! Task replicas: one position in the parallel meta-batch.
//!
//! A replica pairs an inner-loop adapter with the shared initial
//! parameters. The meta-learner rebinds its [`Feed`] for every call; the
//! read operations themselves take a feed and keep no state between calls.

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use maml_core::{MamlError, Result, TaskSample};
use maml_nn::ParamList;

use crate::inner::{AdaptInputs, GradMode, InnerLoop, Unroll};

/// Task data for one replica call.
#[derive(Debug, Clone)]
pub struct Feed {
    /// Context inputs.
    pub x_c: Tensor,
    /// Context labels.
    pub y_c: Tensor,
    /// Target inputs.
    pub x_t: Tensor,
    /// Target labels; only [`Replica::predict`] works without them.
    pub y_t: Option<Tensor>,
    /// Training mode keeps the higher-order graph; evaluation detaches.
    pub is_training: bool,
}

impl Feed {
    /// Moves a task sample onto `device`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Internal`] if a copy fails.
    pub fn from_sample(sample: TaskSample, is_training: bool, device: &Device) -> Result<Self> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("feed to_device: {e}"),
        };
        Ok(Self {
            x_c: sample.x_c.to_device(device).map_err(map_err)?,
            y_c: sample.y_c.to_device(device).map_err(map_err)?,
            x_t: sample.x_t.to_device(device).map_err(map_err)?,
            y_t: Some(sample.y_t.to_device(device).map_err(map_err)?),
            is_training,
        })
    }

    fn inputs(&self) -> AdaptInputs<'_> {
        AdaptInputs {
            x_c: &self.x_c,
            y_c: &self.y_c,
            x_t: &self.x_t,
        }
    }

    fn labels(&self, operation: &'static str) -> Result<&Tensor> {
        self.y_t
            .as_ref()
            .ok_or(MamlError::MissingLabels { operation })
    }
}

/// One replica's contribution to a meta-update.
pub struct ReplicaGradient {
    /// Pinned query loss of the task.
    pub loss: f32,
    /// Gradient w.r.t. each initial parameter, index-aligned with the list.
    pub grads: Vec<Tensor>,
    /// The backward pass's store, reused to deliver the aggregate.
    pub(crate) store: GradStore,
}

impl std::fmt::Debug for ReplicaGradient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaGradient")
            .field("loss", &self.loss)
            .field("grads", &self.grads.len())
            .finish()
    }
}

/// One (feed, adapter, shared parameters) slot of the meta-batch.
#[derive(Debug, Clone)]
pub struct Replica {
    index: usize,
    adapter: InnerLoop,
    params: ParamList,
    feed: Option<Feed>,
}

impl Replica {
    /// Creates replica `index` over the shared `params`.
    pub fn new(index: usize, adapter: InnerLoop, params: ParamList) -> Self {
        Self {
            index,
            adapter,
            params,
            feed: None,
        }
    }

    /// Position in the meta-batch.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The inner-loop adapter.
    pub fn adapter(&self) -> &InnerLoop {
        &self.adapter
    }

    /// The shared initial parameters.
    pub fn params(&self) -> &ParamList {
        &self.params
    }

    /// Binds task data for the next call.
    pub fn bind(&mut self, feed: Feed) {
        self.feed = Some(feed);
    }

    /// Drops the bound task data.
    pub fn clear(&mut self) {
        self.feed = None;
    }

    /// Returns `true` once task data is bound.
    pub fn is_bound(&self) -> bool {
        self.feed.is_some()
    }

    /// The bound task data.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ReplicaUnbound`] if nothing is bound.
    pub fn feed(&self) -> Result<&Feed> {
        self.feed
            .as_ref()
            .ok_or(MamlError::ReplicaUnbound { index: self.index })
    }

    /// Transformed target predictions after `step` inner steps, or after
    /// the pinned training step when `step` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::StepOutOfRange`] if `step > K`.
    pub fn predict(&self, feed: &Feed, step: Option<usize>) -> Result<Tensor> {
        let (unroll, step) = self.unroll(feed, step)?;
        Ok(unroll.prediction(step)?.clone())
    }

    /// Target loss after `step` inner steps (`None` = pinned step).
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::MissingLabels`] without target labels, or
    /// [`MamlError::StepOutOfRange`] if `step > K`.
    pub fn compute_loss(&self, feed: &Feed, step: Option<usize>) -> Result<f32> {
        let y_t = feed.labels("compute_loss")?;
        let (unroll, step) = self.unroll(feed, step)?;
        let loss = self.adapter.kind().loss(y_t, unroll.output(step)?)?;
        scalar(&loss, "compute_loss")
    }

    /// Target top-1 accuracy after `step` inner steps (`None` = pinned
    /// step). Classification only.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::MetricUnavailable`] for regression,
    /// [`MamlError::MissingLabels`] without target labels, or
    /// [`MamlError::StepOutOfRange`] if `step > K`.
    pub fn compute_acc(&self, feed: &Feed, step: Option<usize>) -> Result<f32> {
        let kind = self.adapter.kind();
        if kind.metrics_per_step() < 2 {
            return Err(MamlError::MetricUnavailable {
                metric: "accuracy",
                kind: kind.label(),
            });
        }
        let y_t = feed.labels("compute_acc")?;
        let (unroll, step) = self.unroll(feed, step)?;
        let acc = kind.accuracy(y_t, unroll.output(step)?)?;
        scalar(&acc, "compute_acc")
    }

    /// Loss (and accuracy, for classification) at each of `steps`, from a
    /// single unroll, flattened as `[l, (a,)] per step`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::MissingLabels`] without target labels, or
    /// [`MamlError::StepOutOfRange`] if any step exceeds `K`.
    pub fn evaluate_metrics(&self, feed: &Feed, steps: &[usize]) -> Result<Vec<f32>> {
        let kind = self.adapter.kind();
        let y_t = feed.labels("evaluate_metrics")?;
        let deepest = steps.iter().copied().max().unwrap_or(0);
        let (unroll, _) = self.unroll(feed, Some(deepest))?;

        let mut metrics = Vec::with_capacity(steps.len() * kind.metrics_per_step());
        for &step in steps {
            let out = unroll.output(step)?;
            metrics.push(scalar(&kind.loss(y_t, out)?, "evaluate_metrics")?);
            if kind.metrics_per_step() > 1 {
                metrics.push(scalar(&kind.accuracy(y_t, out)?, "evaluate_metrics")?);
            }
        }
        Ok(metrics)
    }

    /// Gradient of the bound task's pinned query loss w.r.t. the initial
    /// parameters.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ReplicaUnbound`] if nothing is bound, or
    /// [`MamlError::MissingLabels`] without target labels.
    pub fn meta_gradient(&self) -> Result<ReplicaGradient> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("replica {} meta_gradient: {e}", self.index),
        };
        let feed = self.feed()?;
        let y_t = feed.labels("meta_gradient")?;
        let pinned = self.adapter.pinned_step();
        let unroll = self.adapter.adapt_until(
            &self.params.initial_weights(),
            feed.inputs(),
            pinned,
            self.adapter.training_mode(),
        )?;
        let loss = self.adapter.kind().loss(y_t, unroll.output(pinned)?)?;
        let store = loss.backward().map_err(map_err)?;

        let mut grads = Vec::with_capacity(self.params.len());
        for var in self.params.vars() {
            let g = match store.get(var.as_tensor()) {
                Some(g) => g.detach(),
                None => var.as_tensor().zeros_like().map_err(map_err)?,
            };
            grads.push(g);
        }
        Ok(ReplicaGradient {
            loss: scalar(&loss, "meta_gradient")?,
            grads,
            store,
        })
    }

    fn mode(&self, feed: &Feed) -> GradMode {
        if feed.is_training {
            self.adapter.training_mode()
        } else {
            GradMode::Detached
        }
    }

    fn unroll(&self, feed: &Feed, step: Option<usize>) -> Result<(Unroll, usize)> {
        let step = step.unwrap_or_else(|| self.adapter.pinned_step());
        let unroll = self.adapter.adapt_until(
            &self.params.initial_weights(),
            feed.inputs(),
            step,
            self.mode(feed),
        )?;
        Ok((unroll, step))
    }
}

fn scalar(t: &Tensor, what: &str) -> Result<f32> {
    t.to_scalar::<f32>().map_err(|e| MamlError::Internal {
        message: format!("{what}: {e}"),
    })
}

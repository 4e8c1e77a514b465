//! The meta-learner: N task replicas, one aggregated Adam update per step.
//!
//! ## Training step
//!
//! ```text
//! sample N tasks ─▶ bind task i to replica i ─▶ N meta-gradients
//!                                                    │ all succeeded?
//!                                                    ▼
//!                            sum (GradientAggregator) ─▶ AdamW step on P0
//! ```
//!
//! ## Evaluation
//!
//! `eval_samples / N` batches; per batch, one shot count and one query
//! count shared by the whole batch, metrics read at inner steps 1, 2 and 3
//! in evaluation mode, averaged over replicas and then over batches.

use std::time::Instant;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use maml_core::{MamlError, Result, TaskDistribution};
use maml_nn::{ParamList, TaskKind};
use serde::{Deserialize, Serialize};

use crate::aggregate::{GradientAggregator, GradientDevice};
use crate::replica::{Feed, Replica};

/// Inner-step indices at which `evaluate` reads metrics.
pub const EVAL_STEPS: [usize; 3] = [1, 2, 3];

/// Outer-loop hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OuterConfig {
    /// Adam learning rate for the meta-update.
    pub lr: f64,
    /// Where per-replica gradients are summed.
    pub gradient_device: GradientDevice,
}

impl Default for OuterConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            gradient_device: GradientDevice::Model,
        }
    }
}

/// Bi-level MAML optimizer over a fixed set of task replicas.
pub struct MetaLearner {
    params: ParamList,
    replicas: Vec<Replica>,
    aggregator: GradientAggregator,
    optimizer: AdamW,
    train_set: Box<dyn TaskDistribution>,
    eval_set: Box<dyn TaskDistribution>,
    kind: TaskKind,
    tags: Vec<String>,
    clock: Instant,
    updates: usize,
}

impl std::fmt::Debug for MetaLearner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaLearner")
            .field("nr_model", &self.replicas.len())
            .field("params", &self.params)
            .field("kind", &self.kind)
            .field("updates", &self.updates)
            .finish()
    }
}

impl MetaLearner {
    /// Assembles a learner from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::InvalidConfig`] if there are no replicas, the
    /// replicas disagree on the task kind, or the learning rate is not
    /// positive; [`MamlError::StructureMismatch`] if a replica's parameters
    /// differ from `params`.
    pub fn new(
        params: ParamList,
        replicas: Vec<Replica>,
        train_set: Box<dyn TaskDistribution>,
        eval_set: Box<dyn TaskDistribution>,
        outer: &OuterConfig,
        tags: Vec<String>,
    ) -> Result<Self> {
        let Some(first) = replicas.first() else {
            return Err(MamlError::InvalidConfig {
                message: "a meta-learner needs at least one replica".to_string(),
            });
        };
        if !(outer.lr.is_finite() && outer.lr > 0.0) {
            return Err(MamlError::InvalidConfig {
                message: format!("outer learning rate must be > 0, got {}", outer.lr),
            });
        }
        let kind = first.adapter().kind();
        for replica in &replicas {
            if replica.adapter().kind() != kind {
                return Err(MamlError::InvalidConfig {
                    message: format!(
                        "replica {} solves {} tasks, replica 0 solves {kind}",
                        replica.index(),
                        replica.adapter().kind()
                    ),
                });
            }
            params.check_aligned(
                &replica.params().initial_weights().into_inner(),
                &format!("replica {} parameters", replica.index()),
            )?;
        }

        let aggregator = GradientAggregator::new(&params, outer.gradient_device);
        let adam = ParamsAdamW {
            lr: outer.lr,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(params.vars(), adam).map_err(|e| MamlError::Internal {
            message: format!("AdamW init: {e}"),
        })?;

        tracing::info!(
            nr_model = replicas.len(),
            params = params.param_count(),
            kind = %kind,
            "meta-learner ready"
        );

        Ok(Self {
            params,
            replicas,
            aggregator,
            optimizer,
            train_set,
            eval_set,
            kind,
            tags,
            clock: Instant::now(),
            updates: 0,
        })
    }

    /// One meta-update on `meta_batch` freshly sampled training tasks.
    ///
    /// Returns the mean pinned query loss before the update.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::MetaBatchMismatch`] before any sampling if
    /// `meta_batch` differs from the replica count, and
    /// [`MamlError::InvalidConfig`] if a count policy yields zero examples.
    /// Any replica failure aborts the step without touching the parameters.
    pub fn train<S, Q>(&mut self, meta_batch: usize, mut shots: S, mut queries: Q) -> Result<f32>
    where
        S: FnMut() -> usize,
        Q: FnMut() -> usize,
    {
        if meta_batch != self.nr_model() {
            return Err(MamlError::MetaBatchMismatch {
                requested: meta_batch,
                replicas: self.nr_model(),
            });
        }

        let tasks = self.train_set.sample(meta_batch)?;
        let device = self.params.device().clone();
        for (replica, mut task) in self.replicas.iter_mut().zip(tasks) {
            let (num_shots, test_shots) = draw_counts(&mut shots, &mut queries)?;
            let sample = task.sample(num_shots, test_shots)?;
            replica.bind(Feed::from_sample(sample, true, &device)?);
        }

        let parts = self
            .replicas
            .iter()
            .map(Replica::meta_gradient)
            .collect::<Result<Vec<_>>>()?;
        let aggregated = self.aggregator.aggregate(parts)?;
        self.optimizer
            .step(aggregated.store())
            .map_err(|e| MamlError::Internal {
                message: format!("meta-update: {e}"),
            })?;
        self.updates += 1;

        tracing::debug!(
            update = self.updates,
            loss = aggregated.mean_loss,
            "meta-update applied"
        );
        Ok(aggregated.mean_loss)
    }

    /// Average post-adaptation metrics over `eval_samples / N` batches of
    /// evaluation tasks.
    ///
    /// Returns `[l1, l2, l3]` for regression and `[l1, a1, l2, a2, l3, a3]`
    /// for classification, read at inner steps 1, 2 and 3.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::EmptyEvaluation`] if `eval_samples < N`,
    /// [`MamlError::InvalidConfig`] if a count policy yields zero examples,
    /// or [`MamlError::StepOutOfRange`] if fewer than 3 inner steps are
    /// unrolled.
    pub fn evaluate<S, Q>(&mut self, eval_samples: usize, mut shots: S, mut queries: Q) -> Result<Vec<f32>>
    where
        S: FnMut() -> usize,
        Q: FnMut() -> usize,
    {
        let n = self.nr_model();
        let batches = eval_samples / n;
        if batches == 0 {
            return Err(MamlError::EmptyEvaluation {
                eval_samples,
                meta_batch: n,
            });
        }

        let width = EVAL_STEPS.len() * self.kind.metrics_per_step();
        let device = self.params.device().clone();
        let mut totals = vec![0.0f32; width];

        for batch in 0..batches {
            let (num_shots, test_shots) = draw_counts(&mut shots, &mut queries)?;
            let tasks = self.eval_set.sample(n)?;

            let mut grid: Vec<Vec<f32>> = Vec::with_capacity(n);
            for (replica, mut task) in self.replicas.iter_mut().zip(tasks) {
                let sample = task.sample(num_shots, test_shots)?;
                replica.bind(Feed::from_sample(sample, false, &device)?);
                grid.push(replica.evaluate_metrics(replica.feed()?, &EVAL_STEPS)?);
            }

            for (col, total) in totals.iter_mut().enumerate() {
                let mean = grid.iter().map(|row| row[col]).sum::<f32>() / n as f32;
                *total += mean;
            }
            tracing::debug!(batch, num_shots, test_shots, "evaluation batch done");
        }

        for total in &mut totals {
            *total /= batches as f32;
        }
        tracing::info!(batches, metrics = ?totals, "evaluation");
        Ok(totals)
    }

    /// Seconds since the previous call (or since construction).
    pub fn qclock(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.clock).as_secs_f64();
        self.clock = now;
        elapsed
    }

    /// Number of task replicas (the fixed meta-batch size).
    pub fn nr_model(&self) -> usize {
        self.replicas.len()
    }

    /// The shared initial parameters.
    pub fn params(&self) -> &ParamList {
        &self.params
    }

    /// The task replicas.
    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// The task kind.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Meta-updates applied so far.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// The summation handle.
    pub fn aggregator(&self) -> &GradientAggregator {
        &self.aggregator
    }

    /// Outer learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Checkpoint directory name: `<dataset>-<tag>-<tag>...`, where the
    /// dataset is the one the parameters are trained on.
    pub fn save_name(&self) -> String {
        let dataset = self.train_set.dataset_name();
        if self.tags.is_empty() {
            dataset.to_string()
        } else {
            format!("{dataset}-{}", self.tags.join("-"))
        }
    }
}

/// Draws one (context, target) count pair.
fn draw_counts<S, Q>(shots: &mut S, queries: &mut Q) -> Result<(usize, usize)>
where
    S: FnMut() -> usize,
    Q: FnMut() -> usize,
{
    let (num_shots, test_shots) = (shots(), queries());
    if num_shots == 0 || test_shots == 0 {
        return Err(MamlError::InvalidConfig {
            message: format!(
                "tasks need at least one context and one target example, got {num_shots} and {test_shots}"
            ),
        });
    }
    Ok((num_shots, test_shots))
}

//! Epoch loop: train, time, evaluate, checkpoint.

use std::path::PathBuf;

use maml_core::Result;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::meta::MetaLearner;

/// Epoch loop settings.
///
/// Intervals of 0 disable the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSchedule {
    /// Number of epochs.
    pub num_epoch: usize,
    /// Meta-updates per epoch.
    pub steps_per_epoch: usize,
    /// Evaluate every this many epochs.
    pub eval_interval: usize,
    /// Save a checkpoint every this many epochs.
    pub save_interval: usize,
    /// Tasks per evaluation (rounded down to whole meta-batches).
    pub eval_samples: usize,
    /// Tasks per meta-update; must equal the replica count.
    pub meta_batch: usize,
    /// Restore the checkpoint before the first epoch.
    pub resume: bool,
}

impl Default for TrainSchedule {
    fn default() -> Self {
        Self {
            num_epoch: 100,
            steps_per_epoch: 1000,
            eval_interval: 1,
            save_interval: 10,
            eval_samples: 1000,
            meta_batch: 4,
            resume: false,
        }
    }
}

/// One evaluation during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRecord {
    /// Epoch after which it ran.
    pub epoch: usize,
    /// The metric vector returned by [`MetaLearner::evaluate`].
    pub metrics: Vec<f32>,
}

/// What a finished run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Mean training loss per epoch.
    pub train_loss: Vec<f32>,
    /// Evaluations in run order.
    pub evaluations: Vec<EvalRecord>,
    /// Checkpoints written, in run order.
    pub checkpoints: Vec<PathBuf>,
    /// Whether a checkpoint was restored before training.
    pub resumed: bool,
}

impl TrainReport {
    /// The most recent evaluation, if any ran.
    pub fn last_eval(&self) -> Option<&EvalRecord> {
        self.evaluations.last()
    }
}

fn due(epoch: usize, interval: usize) -> bool {
    interval != 0 && epoch % interval == 0
}

/// Runs the full training schedule.
///
/// The same sampling policies serve training and evaluation. The first
/// error halts the run.
///
/// # Errors
///
/// Returns any error from training, evaluation or checkpoint saving.
pub fn run_train<S, Q>(
    learner: &mut MetaLearner,
    schedule: &TrainSchedule,
    mut shots: S,
    mut queries: Q,
    store: &CheckpointStore,
) -> Result<TrainReport>
where
    S: FnMut() -> usize,
    Q: FnMut() -> usize,
{
    let mut report = TrainReport::default();
    if schedule.resume {
        report.resumed = store.restore(learner);
    }

    for epoch in 1..=schedule.num_epoch {
        learner.qclock();
        let mut total = 0.0f32;
        for _ in 0..schedule.steps_per_epoch {
            total += learner.train(schedule.meta_batch, &mut shots, &mut queries)?;
        }
        let train_time = learner.qclock();
        let mean_loss = if schedule.steps_per_epoch == 0 {
            0.0
        } else {
            total / schedule.steps_per_epoch as f32
        };
        report.train_loss.push(mean_loss);
        tracing::info!(epoch, seconds = train_time, loss = mean_loss, "epoch done");

        if due(epoch, schedule.eval_interval) {
            let metrics = learner.evaluate(schedule.eval_samples, &mut shots, &mut queries)?;
            tracing::info!(epoch, metrics = ?metrics, "eval");
            report.evaluations.push(EvalRecord { epoch, metrics });
        }
        if due(epoch, schedule.save_interval) {
            report.checkpoints.push(store.save(learner)?);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_never_fires() {
        assert!(!due(5, 0));
        assert!(due(4, 2));
        assert!(!due(3, 2));
    }

    #[test]
    fn default_schedule_runs_thousand_steps() {
        assert_eq!(TrainSchedule::default().steps_per_epoch, 1000);
    }
}

//! The task-distribution collaborator.
//!
//! The engine never generates data itself: it asks a [`TaskDistribution`]
//! for `n` tasks and asks each [`Task`] for a context (support) set and a
//! target (query) set.

use candle_core::Tensor;

use crate::error::Result;

/// One draw from a task: context inputs/labels and target inputs/labels.
///
/// Inputs have shape `(n, *obs_shape)`. Labels are `(n,)` for regression
/// and one-hot `(n, num_classes)` for classification.
#[derive(Debug, Clone)]
pub struct TaskSample {
    /// Context (support) inputs.
    pub x_c: Tensor,
    /// Context (support) labels.
    pub y_c: Tensor,
    /// Target (query) inputs.
    pub x_t: Tensor,
    /// Target (query) labels.
    pub y_t: Tensor,
}

impl TaskSample {
    /// Number of context examples.
    pub fn num_shots(&self) -> usize {
        self.x_c.dims().first().copied().unwrap_or(0)
    }

    /// Number of target examples.
    pub fn test_shots(&self) -> usize {
        self.x_t.dims().first().copied().unwrap_or(0)
    }
}

/// A single task: a distribution over (input, label) pairs.
pub trait Task {
    /// Samples `num_shots` context examples and `test_shots` target examples.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MamlError::Internal`] if tensor construction fails.
    fn sample(&mut self, num_shots: usize, test_shots: usize) -> Result<TaskSample>;

    /// Returns the full enumerable ground truth `(inputs, labels)`.
    ///
    /// Only used for diagnostics.
    fn get_all_samples(&self) -> Result<(Tensor, Tensor)>;
}

/// A distribution over tasks.
pub trait TaskDistribution {
    /// Dataset name, used to build checkpoint paths.
    fn dataset_name(&self) -> &str;

    /// Samples `n` independent tasks.
    fn sample(&mut self, n: usize) -> Result<Vec<Box<dyn Task>>>;
}

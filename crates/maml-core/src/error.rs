//! Error type shared by every Maml X crate.
//!
//! All failures in the engine are fatal preconditions or structural bugs:
//! nothing is retried, every error surfaces to the driver and halts the run.

use std::path::PathBuf;

/// The error type for all Maml X operations.
///
/// # Example
///
/// ```
/// use maml_core::MamlError;
///
/// let err = MamlError::MetaBatchMismatch { requested: 3, replicas: 4 };
/// assert!(err.to_string().contains("meta_batch"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum MamlError {
    /// `train` was called with a meta-batch size different from the
    /// fixed number of task replicas.
    #[error("meta_batch ({requested}) != nr_model ({replicas})")]
    MetaBatchMismatch { requested: usize, replicas: usize },

    /// A model function ran out of parameters before its forward pass
    /// finished.
    #[error("{owner}: feed-in parameter list exhausted after {consumed} parameters")]
    ParamsExhausted { owner: String, consumed: usize },

    /// A model function finished its forward pass with parameters left over.
    #[error("{owner}: feed-in parameter list is not empty ({remaining} left)")]
    ParamsUnconsumed { owner: String, remaining: usize },

    /// A consumed parameter had a different shape than the layer expects.
    #[error("{owner}: parameter {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        owner: String,
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Two parameter lists (or a gradient list and a parameter list)
    /// do not line up.
    #[error("structure mismatch: {message}")]
    StructureMismatch { message: String },

    /// A task type string was neither "regression" nor "classification".
    #[error("unknown task type '{name}'")]
    UnknownTaskType { name: String },

    /// A step index beyond the unrolled inner loop was requested.
    #[error("step {step} out of range (max {max})")]
    StepOutOfRange { step: usize, max: usize },

    /// A metric was requested that the task kind does not define.
    #[error("metric '{metric}' is not defined for {kind} tasks")]
    MetricUnavailable { metric: &'static str, kind: &'static str },

    /// A replica was used before any data was bound to it.
    #[error("replica {index} has no bound task data")]
    ReplicaUnbound { index: usize },

    /// A loss or accuracy was requested from a feed without target labels.
    #[error("{operation} needs target labels")]
    MissingLabels { operation: &'static str },

    /// `evaluate` was asked for fewer samples than one full meta-batch.
    #[error("eval_samples ({eval_samples}) yields no batch of {meta_batch} tasks")]
    EmptyEvaluation { eval_samples: usize, meta_batch: usize },

    /// A configuration value is out of its valid range.
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    /// Saving or loading a parameter checkpoint failed.
    #[error("checkpoint {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    /// Filesystem failure outside checkpoint tensors (config files, dirs).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Tensor backend failure, prefixed with the operation that hit it.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, MamlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_owner() {
        let err = MamlError::ParamsUnconsumed {
            owner: "mlp_0".to_string(),
            remaining: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("mlp_0"));
        assert!(msg.contains("not empty"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MamlError = io.into();
        assert!(matches!(err, MamlError::Io(_)));
    }
}

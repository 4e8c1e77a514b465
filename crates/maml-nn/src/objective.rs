//! Task kinds: loss function, output transform and metric set.

use std::fmt;

use candle_core::{DType, Tensor, D};
use maml_core::{MamlError, Result};
use serde::{Deserialize, Serialize};

/// What kind of task the meta-learner solves.
///
/// Selects the loss (mean-squared error vs. softmax cross-entropy), the
/// output transform (identity vs. softmax) and the metrics reported per
/// inner-loop step (loss vs. loss + top-1 accuracy).
///
/// # Example
///
/// ```
/// use maml_nn::TaskKind;
///
/// let kind = TaskKind::from_name("regression", 0).unwrap();
/// assert_eq!(kind, TaskKind::Regression);
/// assert_eq!(kind.metrics_per_step(), 1);
/// assert!(TaskKind::from_name("ranking", 0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Scalar regression; labels `(n,)`.
    Regression,
    /// N-way classification; labels one-hot `(n, num_classes)`.
    Classification { num_classes: usize },
}

impl TaskKind {
    /// Builds a task kind from its name, as written in configs and on the
    /// command line. `num_classes` is ignored for regression.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::UnknownTaskType`] for any other name, and
    /// [`MamlError::InvalidConfig`] for classification with fewer than
    /// two classes.
    pub fn from_name(name: &str, num_classes: usize) -> Result<Self> {
        match name {
            "regression" => Ok(Self::Regression),
            "classification" if num_classes >= 2 => Ok(Self::Classification { num_classes }),
            "classification" => Err(MamlError::InvalidConfig {
                message: format!("classification needs at least 2 classes, got {num_classes}"),
            }),
            other => Err(MamlError::UnknownTaskType {
                name: other.to_string(),
            }),
        }
    }

    /// Short label used in messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Classification { .. } => "classification",
        }
    }

    /// Width of the model's output layer.
    pub fn output_dim(&self) -> usize {
        match self {
            Self::Regression => 1,
            Self::Classification { num_classes } => *num_classes,
        }
    }

    /// Number of metrics reported per inner-loop step.
    pub fn metrics_per_step(&self) -> usize {
        match self {
            Self::Regression => 1,
            Self::Classification { .. } => 2,
        }
    }

    /// Loss of raw model `outputs` against `labels`, as a scalar tensor.
    /// An empty batch has loss 0 (and no gradient).
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Internal`] on a shape mismatch or tensor failure.
    pub fn loss(&self, labels: &Tensor, outputs: &Tensor) -> Result<Tensor> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("{} loss: {e}", self.label()),
        };
        if labels.elem_count() == 0 || outputs.elem_count() == 0 {
            return Tensor::zeros((), outputs.dtype(), outputs.device()).map_err(map_err);
        }
        match self {
            Self::Regression => outputs
                .sub(labels)
                .and_then(|d| d.sqr())
                .and_then(|d| d.mean_all())
                .map_err(map_err),
            Self::Classification { .. } => {
                let log_probs =
                    candle_nn::ops::log_softmax(outputs, D::Minus1).map_err(map_err)?;
                labels
                    .mul(&log_probs)
                    .and_then(|t| t.sum(D::Minus1))
                    .and_then(|t| t.mean_all())
                    .and_then(|t| t.neg())
                    .map_err(map_err)
            }
        }
    }

    /// Maps raw outputs to predictions: identity or softmax.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Internal`] if the softmax fails.
    pub fn transform(&self, outputs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Regression => Ok(outputs.clone()),
            Self::Classification { .. } => candle_nn::ops::softmax(outputs, D::Minus1)
                .map_err(|e| MamlError::Internal {
                    message: format!("classification transform: {e}"),
                }),
        }
    }

    /// Top-1 accuracy of `outputs` against one-hot `labels`, as a scalar
    /// tensor in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::MetricUnavailable`] for regression.
    pub fn accuracy(&self, labels: &Tensor, outputs: &Tensor) -> Result<Tensor> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("accuracy: {e}"),
        };
        match self {
            Self::Regression => Err(MamlError::MetricUnavailable {
                metric: "accuracy",
                kind: self.label(),
            }),
            Self::Classification { .. } => {
                let predicted = outputs.argmax(D::Minus1).map_err(map_err)?;
                let expected = labels.argmax(D::Minus1).map_err(map_err)?;
                predicted
                    .eq(&expected)
                    .and_then(|hits| hits.to_dtype(DType::F32))
                    .and_then(|hits| hits.mean_all())
                    .map_err(map_err)
            }
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regression => write!(f, "regression"),
            Self::Classification { num_classes } => write!(f, "classification({num_classes}-way)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn mse_matches_hand_computation() {
        let d = Device::Cpu;
        let y = Tensor::new(&[1.0f32, 2.0, 3.0], &d).unwrap();
        let p = Tensor::new(&[1.0f32, 0.0, 4.0], &d).unwrap();
        let l = TaskKind::Regression
            .loss(&y, &p)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((l - 5.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn mse_rejects_mismatched_shapes() {
        let d = Device::Cpu;
        let y = Tensor::zeros(3, DType::F32, &d).unwrap();
        let p = Tensor::zeros((3, 1), DType::F32, &d).unwrap();
        assert!(TaskKind::Regression.loss(&y, &p).is_err());
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_n() {
        let d = Device::Cpu;
        let kind = TaskKind::Classification { num_classes: 4 };
        let logits = Tensor::zeros((2, 4), DType::F32, &d).unwrap();
        let labels = Tensor::new(&[[1.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]], &d).unwrap();
        let l = kind.loss(&labels, &logits).unwrap().to_scalar::<f32>().unwrap();
        assert!((l - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let d = Device::Cpu;
        let kind = TaskKind::Classification { num_classes: 3 };
        let logits = Tensor::new(&[[3.0f32, 1.0, 0.0], [0.0, 1.0, 3.0]], &d).unwrap();
        let labels = Tensor::new(&[[1.0f32, 0.0, 0.0], [1.0, 0.0, 0.0]], &d).unwrap();
        let acc = kind.accuracy(&labels, &logits).unwrap().to_scalar::<f32>().unwrap();
        assert!((acc - 0.5).abs() < 1e-6);
    }

    #[test]
    fn regression_has_no_accuracy() {
        let d = Device::Cpu;
        let t = Tensor::zeros(2, DType::F32, &d).unwrap();
        let err = TaskKind::Regression.accuracy(&t, &t).unwrap_err();
        assert!(matches!(err, MamlError::MetricUnavailable { .. }));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let d = Device::Cpu;
        let kind = TaskKind::Classification { num_classes: 3 };
        let logits = Tensor::new(&[[1.0f32, 2.0, 3.0]], &d).unwrap();
        let probs = kind.transform(&logits).unwrap().to_vec2::<f32>().unwrap();
        assert!((probs[0].iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn from_name_selects_variant() {
        assert_eq!(
            TaskKind::from_name("classification", 5).unwrap(),
            TaskKind::Classification { num_classes: 5 }
        );
        assert_eq!(TaskKind::from_name("regression", 5).unwrap(), TaskKind::Regression);
        let err = TaskKind::from_name("density", 1).unwrap_err();
        assert!(matches!(err, MamlError::UnknownTaskType { .. }));
    }

    #[test]
    fn empty_batch_has_zero_loss() {
        let d = Device::Cpu;
        let y = Tensor::zeros(0, DType::F32, &d).unwrap();
        let p = Tensor::zeros(0, DType::F32, &d).unwrap();
        let l = TaskKind::Regression.loss(&y, &p).unwrap();
        assert_eq!(l.to_scalar::<f32>().unwrap(), 0.0);

        let y = Tensor::zeros((0, 3), DType::F32, &d).unwrap();
        let p = Tensor::zeros((0, 3), DType::F32, &d).unwrap();
        let kind = TaskKind::Classification { num_classes: 3 };
        let l = kind.loss(&y, &p).unwrap().to_scalar::<f32>().unwrap();
        assert!(l.is_finite());
        assert_eq!(l, 0.0);
    }
}

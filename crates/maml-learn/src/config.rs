//! Run configuration, loadable from JSON.
//!
//! Every field has a default, so a config file only lists what it changes:
//!
//! ```json
//! { "nr_model": 8, "inner": { "alpha": 0.01, "inner_iters": 1 } }
//! ```

use std::path::{Path, PathBuf};

use maml_core::sampling::{fixed_count, uniform_count};
use maml_core::tasks::{BlobConfig, BlobFamily, SineConfig, SineFamily};
use maml_core::{MamlError, Result, TaskDistribution};
use maml_nn::{ModelSpec, MlpConfig, TaskKind};
use serde::{Deserialize, Serialize};

use crate::driver::TrainSchedule;
use crate::inner::InnerLoopConfig;
use crate::meta::OuterConfig;

/// Which reference task family to train on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum FamilyConfig {
    /// Sinusoid regression.
    Sine(SineConfig),
    /// Gaussian-blob classification.
    Blobs(BlobConfig),
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self::Sine(SineConfig::default())
    }
}

impl FamilyConfig {
    /// Classes per task; 0 for regression families.
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Sine(_) => 0,
            Self::Blobs(blobs) => blobs.num_classes,
        }
    }

    /// Shape of one input example.
    pub fn obs_shape(&self) -> Vec<usize> {
        match self {
            Self::Sine(_) => vec![1],
            Self::Blobs(blobs) => vec![blobs.dim],
        }
    }

    /// The task kind this family produces labels for.
    pub fn natural_kind(&self) -> TaskKind {
        match self {
            Self::Sine(_) => TaskKind::Regression,
            Self::Blobs(blobs) => TaskKind::Classification {
                num_classes: blobs.num_classes,
            },
        }
    }

    /// Instantiates the family with its own seed.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::InvalidConfig`] for a degenerate blob family.
    pub fn distribution(&self, seed: u64) -> Result<Box<dyn TaskDistribution>> {
        Ok(match self {
            Self::Sine(config) => Box::new(SineFamily::new(config.clone(), seed)),
            Self::Blobs(config) => Box::new(BlobFamily::new(config.clone(), seed)?),
        })
    }
}

/// How many context (or query) examples to draw per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CountPolicy {
    /// Always `n`.
    Fixed { n: usize },
    /// Uniform over `[lo, hi]`.
    Uniform { lo: usize, hi: usize },
}

impl CountPolicy {
    /// Builds the sampling closure.
    pub fn sampler(&self, seed: u64) -> Box<dyn FnMut() -> usize> {
        match *self {
            Self::Fixed { n } => Box::new(fixed_count(n)),
            Self::Uniform { lo, hi } => Box::new(uniform_count(lo, hi, seed)),
        }
    }

    fn validate(&self, what: &str) -> Result<()> {
        let ok = match *self {
            Self::Fixed { n } => n > 0,
            Self::Uniform { lo, hi } => lo > 0 && lo <= hi,
        };
        if ok {
            Ok(())
        } else {
            Err(MamlError::InvalidConfig {
                message: format!("{what} policy {self:?} can draw an empty set"),
            })
        }
    }
}

/// Full configuration of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MamlConfig {
    /// "regression" or "classification".
    pub task_type: String,
    /// Task family for training and evaluation.
    pub family: FamilyConfig,
    /// Model architecture.
    pub model: ModelSpec,
    /// Inner-loop hyperparameters.
    pub inner: InnerLoopConfig,
    /// Outer-loop hyperparameters.
    pub outer: OuterConfig,
    /// Number of task replicas (the meta-batch size).
    pub nr_model: usize,
    /// Seed for parameter init and task sampling.
    pub seed: u64,
    /// Context examples per task.
    pub shots: CountPolicy,
    /// Query examples per task.
    pub queries: CountPolicy,
    /// Epoch loop settings.
    pub schedule: TrainSchedule,
    /// Root directory for checkpoints.
    pub checkpoint_dir: PathBuf,
    /// Run tags appended to the checkpoint directory name.
    pub tags: Vec<String>,
}

impl Default for MamlConfig {
    fn default() -> Self {
        Self {
            task_type: "regression".to_string(),
            family: FamilyConfig::default(),
            model: ModelSpec::Mlp(MlpConfig::mlp2(1)),
            inner: InnerLoopConfig::default(),
            outer: OuterConfig::default(),
            nr_model: 4,
            seed: 42,
            shots: CountPolicy::Uniform { lo: 5, hi: 10 },
            queries: CountPolicy::Fixed { n: 10 },
            schedule: TrainSchedule::default(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            tags: vec!["maml".to_string()],
        }
    }
}

impl MamlConfig {
    /// Reads a config from a JSON file; missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Io`] if the file cannot be read, or
    /// [`MamlError::InvalidConfig`] if it is not valid JSON for this type.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parses a config from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::InvalidConfig`] on malformed JSON.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| MamlError::InvalidConfig {
            message: format!("config json: {e}"),
        })
    }

    /// Serializes the config as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Internal`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| MamlError::Internal {
            message: format!("config json: {e}"),
        })
    }

    /// Resolves the task kind and checks it against the family and model.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::UnknownTaskType`] for an unknown task type, or
    /// [`MamlError::InvalidConfig`] if the task type, family, model width
    /// or sampling policies disagree.
    pub fn task_kind(&self) -> Result<TaskKind> {
        let kind = TaskKind::from_name(&self.task_type, self.family.num_classes())?;
        if kind != self.family.natural_kind() {
            return Err(MamlError::InvalidConfig {
                message: format!(
                    "task type {kind} does not match the family's {}",
                    self.family.natural_kind()
                ),
            });
        }
        if self.model.num_outputs() != kind.output_dim() {
            return Err(MamlError::InvalidConfig {
                message: format!(
                    "model has {} outputs, {kind} needs {}",
                    self.model.num_outputs(),
                    kind.output_dim()
                ),
            });
        }
        self.shots.validate("shots")?;
        self.queries.validate("queries")?;
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            MamlConfig::from_json_str(r#"{ "nr_model": 8, "inner": { "alpha": 0.5 } }"#).unwrap();
        assert_eq!(config.nr_model, 8);
        assert_eq!(config.inner.alpha, 0.5);
        assert_eq!(config.inner.inner_iters, 1);
        assert_eq!(config.outer, OuterConfig::default());
    }

    #[test]
    fn json_round_trips() {
        let mut config = MamlConfig::default();
        config.family = FamilyConfig::Blobs(BlobConfig::default());
        config.task_type = "classification".to_string();
        let text = config.to_json().unwrap();
        assert_eq!(MamlConfig::from_json_str(&text).unwrap(), config);
    }

    #[test]
    fn default_config_is_consistent() {
        assert_eq!(MamlConfig::default().task_kind().unwrap(), TaskKind::Regression);
    }

    #[test]
    fn unknown_task_type_is_reported() {
        let config = MamlConfig {
            task_type: "density".to_string(),
            ..MamlConfig::default()
        };
        assert!(matches!(
            config.task_kind(),
            Err(MamlError::UnknownTaskType { .. })
        ));
    }

    #[test]
    fn model_width_must_match_classes() {
        let config = MamlConfig {
            task_type: "classification".to_string(),
            family: FamilyConfig::Blobs(BlobConfig::default()),
            ..MamlConfig::default()
        };
        assert!(matches!(
            config.task_kind(),
            Err(MamlError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn empty_shot_policy_is_rejected() {
        let config = MamlConfig {
            shots: CountPolicy::Uniform { lo: 0, hi: 3 },
            ..MamlConfig::default()
        };
        assert!(config.task_kind().is_err());
    }
}

//! Saving and restoring the shared initial parameters.
//!
//! Layout: `<root>/<dataset>-<tag>-.../params.safetensors`, one tensor per
//! parameter keyed by its scoped name.

use std::path::{Path, PathBuf};

use maml_core::{MamlError, Result};
use maml_nn::ParamList;

use crate::meta::MetaLearner;

/// File name of the parameter checkpoint inside its directory.
pub const CHECKPOINT_FILE: &str = "params.safetensors";

/// Checkpoint directory root.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Creates a store rooted at `root`. Nothing is created on disk yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the checkpoint of `learner`.
    pub fn dir_for(&self, learner: &MetaLearner) -> PathBuf {
        self.root.join(learner.save_name())
    }

    /// Checkpoint file of `learner`.
    pub fn path_for(&self, learner: &MetaLearner) -> PathBuf {
        self.dir_for(learner).join(CHECKPOINT_FILE)
    }

    /// Writes the learner's parameters, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Io`] if the directory cannot be created, or
    /// [`MamlError::Checkpoint`] if the file cannot be written.
    pub fn save(&self, learner: &MetaLearner) -> Result<PathBuf> {
        std::fs::create_dir_all(self.dir_for(learner))?;
        let path = self.path_for(learner);
        save_params(learner.params(), &path)?;
        tracing::info!(path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Loads the learner's parameters if a usable checkpoint exists.
    ///
    /// Best-effort: a missing, unreadable or mismatched file is logged and
    /// leaves the parameters untouched. Returns whether anything was
    /// restored.
    pub fn restore(&self, learner: &MetaLearner) -> bool {
        let path = self.path_for(learner);
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no checkpoint to restore");
            return false;
        }
        match load_params(learner.params(), &path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "checkpoint restored");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint not restored");
                false
            }
        }
    }
}

/// Writes `params` to `path` as safetensors.
///
/// # Errors
///
/// Returns [`MamlError::Checkpoint`] if the write fails.
pub fn save_params(params: &ParamList, path: &Path) -> Result<()> {
    params.var_map().save(path).map_err(|e| MamlError::Checkpoint {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Loads every parameter of `params` from `path`.
///
/// All names and shapes are checked before any value is written, so a
/// failed load leaves `params` unchanged.
///
/// # Errors
///
/// Returns [`MamlError::Checkpoint`] if the file cannot be read, lacks a
/// parameter, or stores one with a different shape.
pub fn load_params(params: &ParamList, path: &Path) -> Result<()> {
    let checkpoint_err = |message: String| MamlError::Checkpoint {
        path: path.to_path_buf(),
        message,
    };
    let mut tensors = candle_core::safetensors::load(path, params.device())
        .map_err(|e| checkpoint_err(e.to_string()))?;

    let mut staged = Vec::with_capacity(params.len());
    for entry in params.entries() {
        let tensor = tensors
            .remove(&entry.name)
            .ok_or_else(|| checkpoint_err(format!("missing parameter {}", entry.name)))?;
        if tensor.dims() != entry.var.dims() {
            return Err(checkpoint_err(format!(
                "{} has shape {:?}, expected {:?}",
                entry.name,
                tensor.dims(),
                entry.var.dims()
            )));
        }
        staged.push((entry, tensor));
    }
    for (entry, tensor) in staged {
        entry
            .var
            .set(&tensor)
            .map_err(|e| checkpoint_err(format!("{}: {e}", entry.name)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use maml_core::NameCounters;
    use maml_nn::{Mlp, MlpConfig, ParamBuilder, ParamFn};

    fn params(seed: u64) -> ParamList {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 1), candle_core::DType::F32, &device).unwrap();
        let mut counters = NameCounters::new();
        Mlp::new(MlpConfig::mlp2(1))
            .create(&x, ParamBuilder::new(&mut counters, seed, &device))
            .unwrap()
            .1
    }

    #[test]
    fn load_restores_saved_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let saved = params(1);
        save_params(&saved, &path).unwrap();

        let other = params(2);
        assert_ne!(other.to_host().unwrap(), saved.to_host().unwrap());
        load_params(&other, &path).unwrap();
        assert_eq!(other.to_host().unwrap(), saved.to_host().unwrap());
    }

    #[test]
    fn mismatched_checkpoint_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        save_params(&params(1), &path).unwrap();

        let device = Device::Cpu;
        let x = Tensor::zeros((2, 1), candle_core::DType::F32, &device).unwrap();
        let mut counters = NameCounters::new();
        let (_, wide) = Mlp::new(MlpConfig::mlp5(1))
            .create(&x, ParamBuilder::new(&mut counters, 3, &device))
            .unwrap();
        let before = wide.to_host().unwrap();
        assert!(matches!(
            load_params(&wide, &path),
            Err(MamlError::Checkpoint { .. })
        ));
        assert_eq!(wide.to_host().unwrap(), before);
    }

    #[test]
    fn unreadable_file_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        std::fs::write(&path, b"not safetensors").unwrap();
        assert!(matches!(
            load_params(&params(1), &path),
            Err(MamlError::Checkpoint { .. })
        ));
    }
}

//! Wiring a [`MetaLearner`] from configuration.
//!
//! Builds the model function, creates its parameters once under a fresh
//! [`NameCounters`], and hands every replica its own adapter over the same
//! shared parameter list. All handles are owned by the returned learner.

use candle_core::{Device, Tensor};
use maml_core::{MamlError, NameCounters, Result, TaskDistribution};
use maml_nn::{ParamBuilder, ParamList};

use crate::config::MamlConfig;
use crate::inner::InnerLoop;
use crate::meta::MetaLearner;
use crate::replica::Replica;

/// Root scope of every parameter name.
pub const ROOT_SCOPE: &str = "maml";

/// Builds a learner for the configured task family.
///
/// Training and evaluation draw from two instances of the family with
/// different seeds.
///
/// # Errors
///
/// Returns configuration errors from [`MamlConfig::task_kind`] or any
/// construction error.
pub fn build_learner(config: &MamlConfig, device: &Device) -> Result<MetaLearner> {
    let train_set = config.family.distribution(config.seed.wrapping_add(1))?;
    let eval_set = config.family.distribution(config.seed.wrapping_add(2))?;
    build_learner_with(config, train_set, eval_set, &config.family.obs_shape(), device)
}

/// Builds a learner over caller-supplied task distributions.
///
/// `obs_shape` is the shape of one input example; it fixes the input width
/// of the created parameters.
///
/// # Errors
///
/// Returns configuration errors from [`MamlConfig::task_kind`] or any
/// construction error.
pub fn build_learner_with(
    config: &MamlConfig,
    train_set: Box<dyn TaskDistribution>,
    eval_set: Box<dyn TaskDistribution>,
    obs_shape: &[usize],
    device: &Device,
) -> Result<MetaLearner> {
    let kind = config.task_kind()?;
    if config.nr_model == 0 {
        return Err(MamlError::InvalidConfig {
            message: "nr_model must be at least 1".to_string(),
        });
    }

    let model = config.model.build();
    let params = create_params(config, obs_shape, device)?;
    tracing::debug!(names = ?params.names(), "parameters created");

    let replicas = (0..config.nr_model)
        .map(|i| -> Result<Replica> {
            let adapter = InnerLoop::new(model.clone(), kind, config.inner.clone())?;
            Ok(Replica::new(i, adapter, params.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    MetaLearner::new(
        params,
        replicas,
        train_set,
        eval_set,
        &config.outer,
        config.tags.clone(),
    )
}

/// Creates the shared initial parameters by running the model once on a
/// zero batch of one example.
///
/// # Errors
///
/// Returns model or tensor errors.
pub fn create_params(config: &MamlConfig, obs_shape: &[usize], device: &Device) -> Result<ParamList> {
    let mut shape = Vec::with_capacity(obs_shape.len() + 1);
    shape.push(1);
    shape.extend_from_slice(obs_shape);
    let x = Tensor::zeros(shape, maml_nn::params::PARAM_DTYPE, device).map_err(|e| {
        MamlError::Internal {
            message: format!("create_params: {e}"),
        }
    })?;

    let mut counters = NameCounters::new();
    let mut builder = ParamBuilder::new(&mut counters, config.seed, device);
    builder.enter(ROOT_SCOPE);
    let (_, params) = config.model.build().create(&x, builder)?;
    Ok(params)
}

//! The parameterized model function contract.
//!
//! A model is a pure function `(input batch, parameter list) → output
//! batch`. Called without parameters it creates them, in a fixed order, and
//! hands the ordered list back; called with parameters it consumes exactly
//! that list in the same order and fails if the list is too short, too long
//! or differently shaped.

use std::sync::Arc;

use candle_core::Tensor;
use maml_core::Result;
use serde::{Deserialize, Serialize};

use crate::conv::{ConvConfig, ConvNet};
use crate::mlp::{Mlp, MlpConfig};
use crate::params::{ParamBuilder, ParamCursor, ParamList, ParamSource};

/// A model function with explicitly threaded parameters.
///
/// Implementors only write [`forward`](Self::forward); the creation and
/// consumption forms share it, which keeps their traversal orders equal.
pub trait ParamFn: Send + Sync {
    /// Scope prefix for parameter names (`mlp`, `conv`, ...).
    fn prefix(&self) -> &'static str;

    /// Runs the model, drawing every parameter from `params` in traversal
    /// order.
    ///
    /// # Errors
    ///
    /// Returns parameter-threading errors from the source or tensor errors.
    fn forward(&self, x: &Tensor, params: &mut ParamSource<'_>) -> Result<Tensor>;

    /// The "params omitted" form: creates a fresh parameter list while
    /// computing the output for `x`.
    ///
    /// # Errors
    ///
    /// Returns tensor errors from the forward pass.
    fn create(&self, x: &Tensor, builder: ParamBuilder<'_>) -> Result<(Tensor, ParamList)> {
        let mut source = ParamSource::Create(builder);
        source.enter(self.prefix());
        let out = self.forward(x, &mut source)?;
        source.exit();
        match source {
            ParamSource::Create(builder) => Ok((out, builder.finish()?)),
            ParamSource::Consume(_) => unreachable!("source was built as Create"),
        }
    }

    /// The "params supplied" form: consumes `params` fully, in order.
    ///
    /// # Errors
    ///
    /// Returns [`maml_core::MamlError::ParamsExhausted`],
    /// [`maml_core::MamlError::ParamsUnconsumed`] or
    /// [`maml_core::MamlError::ShapeMismatch`] on a structural mismatch.
    fn apply(&self, x: &Tensor, params: &[Tensor]) -> Result<Tensor> {
        let mut source = ParamSource::Consume(ParamCursor::new(self.prefix(), params));
        let out = self.forward(x, &mut source)?;
        match source {
            ParamSource::Consume(cursor) => cursor.finish()?,
            ParamSource::Create(_) => unreachable!("source was built as Consume"),
        }
        Ok(out)
    }
}

/// Serializable choice of reference architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "arch", rename_all = "snake_case")]
pub enum ModelSpec {
    /// Fully connected stack (regression or flat-input classification).
    Mlp(MlpConfig),
    /// Convolutional stack with a dense classification head.
    Conv(ConvConfig),
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self::Mlp(MlpConfig::mlp2(1))
    }
}

impl ModelSpec {
    /// Instantiates the model function.
    pub fn build(&self) -> Arc<dyn ParamFn> {
        match self {
            Self::Mlp(config) => Arc::new(Mlp::new(config.clone())),
            Self::Conv(config) => Arc::new(ConvNet::new(config.clone())),
        }
    }

    /// Width of the output layer.
    pub fn num_outputs(&self) -> usize {
        match self {
            Self::Mlp(config) => config.num_outputs,
            Self::Conv(config) => config.num_classes,
        }
    }
}

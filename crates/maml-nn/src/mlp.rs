//! Fully connected model function.

use candle_core::Tensor;
use maml_core::{MamlError, Result};
use serde::{Deserialize, Serialize};

use crate::layers::{dense, Activation};
use crate::model::ParamFn;
use crate::params::ParamSource;

/// Architecture of a dense stack.
///
/// # Example
///
/// ```
/// use maml_nn::mlp::MlpConfig;
///
/// let config = MlpConfig::mlp2(1);
/// assert_eq!(config.hidden, vec![40, 40]);
/// // 1·40 + 40 + 40·40 + 40 + 40·1 + 1
/// assert_eq!(config.param_count(1), 1761);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Hidden layer widths, input side first.
    pub hidden: Vec<usize>,
    /// Output width. A width of 1 is squeezed to `(batch,)`.
    pub num_outputs: usize,
    /// Hidden nonlinearity.
    #[serde(default)]
    pub activation: Activation,
}

impl MlpConfig {
    /// Two hidden layers of 40 units, as in the MAML sinusoid experiments.
    pub fn mlp2(num_outputs: usize) -> Self {
        Self {
            hidden: vec![40, 40],
            num_outputs,
            activation: Activation::Relu,
        }
    }

    /// Four hidden layers of 256 units.
    pub fn mlp5(num_outputs: usize) -> Self {
        Self {
            hidden: vec![256; 4],
            num_outputs,
            activation: Activation::Relu,
        }
    }

    /// Number of scalar parameters for flattened inputs of width `in_dim`.
    pub fn param_count(&self, in_dim: usize) -> usize {
        let mut prev = in_dim;
        let mut total = 0;
        for &width in self.hidden.iter().chain(std::iter::once(&self.num_outputs)) {
            total += prev * width + width;
            prev = width;
        }
        total
    }
}

/// Dense stack: flatten, hidden layers with activation, linear output.
#[derive(Debug, Clone)]
pub struct Mlp {
    config: MlpConfig,
}

impl Mlp {
    /// Creates the model function.
    pub fn new(config: MlpConfig) -> Self {
        Self { config }
    }

    /// The architecture.
    pub fn config(&self) -> &MlpConfig {
        &self.config
    }
}

impl ParamFn for Mlp {
    fn prefix(&self) -> &'static str {
        "mlp"
    }

    fn forward(&self, x: &Tensor, params: &mut ParamSource<'_>) -> Result<Tensor> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("mlp forward: {e}"),
        };
        let mut h = if x.rank() == 2 {
            x.clone()
        } else {
            x.flatten_from(1).map_err(map_err)?
        };
        for &width in &self.config.hidden {
            h = dense(&h, width, Some(self.config.activation), params)?;
        }
        let out = dense(&h, self.config.num_outputs, None, params)?;
        if self.config.num_outputs == 1 {
            out.squeeze(1).map_err(map_err)
        } else {
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamBuilder;
    use candle_core::{DType, Device};
    use maml_core::NameCounters;

    #[test]
    fn regression_output_is_flat() {
        let device = Device::Cpu;
        let model = Mlp::new(MlpConfig::mlp2(1));
        let x = Tensor::ones((6, 1), DType::F32, &device).unwrap();
        let mut counters = NameCounters::new();
        let (y, params) = model
            .create(&x, ParamBuilder::new(&mut counters, 0, &device))
            .unwrap();
        assert_eq!(y.dims(), &[6]);
        assert_eq!(params.len(), 6);
        assert_eq!(params.param_count(), MlpConfig::mlp2(1).param_count(1));
    }

    #[test]
    fn weights_precede_biases_per_layer() {
        let device = Device::Cpu;
        let model = Mlp::new(MlpConfig {
            hidden: vec![3],
            num_outputs: 2,
            activation: Activation::Tanh,
        });
        let x = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let mut counters = NameCounters::new();
        let (_, params) = model
            .create(&x, ParamBuilder::new(&mut counters, 0, &device))
            .unwrap();
        assert_eq!(
            params.names(),
            vec![
                "mlp_0/dense_0/W",
                "mlp_0/dense_0/b",
                "mlp_0/dense_1/W",
                "mlp_0/dense_1/b"
            ]
        );
        assert_eq!(params.shapes(), vec![vec![4, 3], vec![3], vec![3, 2], vec![2]]);
    }

    #[test]
    fn image_inputs_are_flattened() {
        let device = Device::Cpu;
        let model = Mlp::new(MlpConfig {
            hidden: vec![8],
            num_outputs: 5,
            activation: Activation::Relu,
        });
        let x = Tensor::ones((2, 1, 4, 4), DType::F32, &device).unwrap();
        let mut counters = NameCounters::new();
        let (y, params) = model
            .create(&x, ParamBuilder::new(&mut counters, 0, &device))
            .unwrap();
        assert_eq!(y.dims(), &[2, 5]);
        assert_eq!(params.shapes()[0], vec![16, 8]);
    }
}

//! Convolutional model function for image classification.

use candle_core::Tensor;
use maml_core::{MamlError, Result};
use serde::{Deserialize, Serialize};

use crate::layers::{conv2d, dense, Activation, ConvSpec, Padding};
use crate::model::ParamFn;
use crate::params::ParamSource;

/// Architecture of a conv stack with a dense head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    /// Convolution layers, input side first.
    pub layers: Vec<ConvSpec>,
    /// Width of the classification head.
    pub num_classes: usize,
    /// Nonlinearity after every convolution.
    #[serde(default)]
    pub activation: Activation,
}

impl ConvConfig {
    /// Six-layer stack for 28x28 single-channel characters.
    ///
    /// # Example
    ///
    /// ```
    /// use maml_nn::conv::ConvConfig;
    ///
    /// let config = ConvConfig::omniglot(5);
    /// assert_eq!(config.layers.len(), 6);
    /// assert_eq!(config.layers[5].channels, 256);
    /// ```
    pub fn omniglot(num_classes: usize) -> Self {
        let layer = |channels, filter, stride, padding| ConvSpec {
            channels,
            filter,
            stride,
            padding,
        };
        Self {
            layers: vec![
                layer(64, 3, 1, Padding::Same),
                layer(64, 3, 2, Padding::Same),
                layer(128, 3, 1, Padding::Same),
                layer(128, 3, 2, Padding::Same),
                layer(256, 4, 1, Padding::Valid),
                layer(256, 4, 1, Padding::Valid),
            ],
            num_classes,
            activation: Activation::Relu,
        }
    }
}

/// Conv stack: convolutions with activation, flatten, linear head.
#[derive(Debug, Clone)]
pub struct ConvNet {
    config: ConvConfig,
}

impl ConvNet {
    /// Creates the model function.
    pub fn new(config: ConvConfig) -> Self {
        Self { config }
    }

    /// The architecture.
    pub fn config(&self) -> &ConvConfig {
        &self.config
    }
}

impl ParamFn for ConvNet {
    fn prefix(&self) -> &'static str {
        "conv"
    }

    fn forward(&self, x: &Tensor, params: &mut ParamSource<'_>) -> Result<Tensor> {
        let mut h = x.clone();
        for spec in &self.config.layers {
            h = conv2d(&h, spec, Some(self.config.activation), params)?;
        }
        let flat = h.flatten_from(1).map_err(|e| MamlError::Internal {
            message: format!("conv flatten: {e}"),
        })?;
        dense(&flat, self.config.num_classes, None, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamBuilder;
    use candle_core::{DType, Device};
    use maml_core::NameCounters;

    #[test]
    fn omniglot_geometry() {
        let device = Device::Cpu;
        let model = ConvNet::new(ConvConfig::omniglot(5));
        let x = Tensor::zeros((1, 1, 28, 28), DType::F32, &device).unwrap();
        let mut counters = NameCounters::new();
        let (y, params) = model
            .create(&x, ParamBuilder::new(&mut counters, 0, &device))
            .unwrap();
        assert_eq!(y.dims(), &[1, 5]);
        // 28 → 28 → 14 → 14 → 7 → 4 → 1, so the head sees 256 features.
        assert_eq!(params.shapes().last(), Some(&vec![5]));
        assert_eq!(params.shapes()[12], vec![256, 5]);
        assert_eq!(params.len(), 14);
    }

    #[test]
    fn apply_reproduces_create() {
        let device = Device::Cpu;
        let model = ConvNet::new(ConvConfig {
            layers: vec![ConvSpec {
                channels: 2,
                filter: 3,
                stride: 1,
                padding: Padding::Valid,
            }],
            num_classes: 3,
            activation: Activation::Relu,
        });
        let x = Tensor::ones((2, 1, 5, 5), DType::F32, &device).unwrap();
        let mut counters = NameCounters::new();
        let (y, params) = model
            .create(&x, ParamBuilder::new(&mut counters, 4, &device))
            .unwrap();
        let y2 = model.apply(&x, params.initial_weights().tensors()).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), y2.to_vec2::<f32>().unwrap());
    }
}

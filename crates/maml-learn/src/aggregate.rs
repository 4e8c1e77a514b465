//! Summation of per-replica meta-gradients.

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use maml_core::{MamlError, Result};
use maml_nn::{check_structure, ParamList};
use serde::{Deserialize, Serialize};

use crate::replica::ReplicaGradient;

/// Where the elementwise sum runs. Only affects speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientDevice {
    /// Sum on the host.
    Cpu,
    /// Sum on the device the parameters live on.
    #[default]
    Model,
}

/// The summed gradient, ready for the optimizer.
#[derive(Debug)]
pub struct AggregatedGradient {
    /// Elementwise sum across replicas, index-aligned with the parameters.
    pub grads: Vec<Tensor>,
    /// Mean pinned loss across replicas.
    pub mean_loss: f32,
    /// Number of replicas summed.
    pub replicas: usize,
    store: GradStore,
}

impl AggregatedGradient {
    /// The store the optimizer reads, keyed by the parameter variables.
    pub fn store(&self) -> &GradStore {
        &self.store
    }
}

/// Owned handle for the meta-gradient summation.
#[derive(Debug, Clone)]
pub struct GradientAggregator {
    placement: GradientDevice,
    model_device: Device,
    vars: Vec<Var>,
    shapes: Vec<Vec<usize>>,
}

impl GradientAggregator {
    /// Creates an aggregator for the parameters in `params`.
    pub fn new(params: &ParamList, placement: GradientDevice) -> Self {
        Self {
            placement,
            model_device: params.device().clone(),
            vars: params.vars(),
            shapes: params.shapes(),
        }
    }

    /// Where sums are computed.
    pub fn placement(&self) -> GradientDevice {
        self.placement
    }

    fn sum_device(&self) -> Device {
        match self.placement {
            GradientDevice::Cpu => Device::Cpu,
            GradientDevice::Model => self.model_device.clone(),
        }
    }

    /// Sums every replica's gradient list into one.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::StructureMismatch`] if `parts` is empty or any
    /// gradient list is not aligned with the parameters.
    pub fn aggregate(&self, parts: Vec<ReplicaGradient>) -> Result<AggregatedGradient> {
        let map_err = |e: candle_core::Error| MamlError::Internal {
            message: format!("aggregate: {e}"),
        };
        if parts.is_empty() {
            return Err(MamlError::StructureMismatch {
                message: "no replica gradients to aggregate".to_string(),
            });
        }
        for (i, part) in parts.iter().enumerate() {
            check_structure(&self.shapes, &part.grads, &format!("replica {i} gradient"))?;
        }

        let device = self.sum_device();
        let replicas = parts.len();
        let mean_loss = parts.iter().map(|p| p.loss).sum::<f32>() / replicas as f32;

        let mut sums: Vec<Tensor> = Vec::with_capacity(self.vars.len());
        for g in &parts[0].grads {
            sums.push(g.to_device(&device).map_err(map_err)?);
        }
        for part in &parts[1..] {
            for (sum, g) in sums.iter_mut().zip(&part.grads) {
                *sum = sum
                    .add(&g.to_device(&device).map_err(map_err)?)
                    .map_err(map_err)?;
            }
        }
        let grads = sums
            .into_iter()
            .map(|s| s.to_device(&self.model_device))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_err)?;

        let mut store = parts
            .into_iter()
            .next()
            .map(|p| p.store)
            .ok_or_else(|| MamlError::StructureMismatch {
                message: "no replica gradients to aggregate".to_string(),
            })?;
        for (var, g) in self.vars.iter().zip(&grads) {
            store.insert(var.as_tensor(), g.clone());
        }

        Ok(AggregatedGradient {
            grads,
            mean_loss,
            replicas,
            store,
        })
    }
}

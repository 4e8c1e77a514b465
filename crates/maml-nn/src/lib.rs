//! # maml-nn
//!
//! Parameterized model functions for Maml X.
//!
//! A model here is a pure function of its input batch and an explicitly
//! threaded parameter list. It has no hidden variables, so the inner loop
//! can evaluate it at any number of adapted parameter snapshots.
//!
//! ## Key Types
//!
//! - [`ParamFn`]: the model function contract (create / apply)
//! - [`ParamList`] / [`FastWeights`]: meta parameters and per-step snapshots
//! - [`ParamCursor`]: checked in-order consumption of a parameter list
//! - [`Mlp`] / [`ConvNet`]: reference architectures
//! - [`TaskKind`]: loss, output transform and metric set per task type
//!
//! ## Example
//!
//! ```
//! use candle_core::{DType, Device, Tensor};
//! use maml_core::NameCounters;
//! use maml_nn::{Mlp, MlpConfig, ParamBuilder, ParamFn};
//!
//! let device = Device::Cpu;
//! let model = Mlp::new(MlpConfig::mlp2(1));
//! let x = Tensor::zeros((10, 1), DType::F32, &device).unwrap();
//! let mut counters = NameCounters::new();
//! let (_, params) = model
//!     .create(&x, ParamBuilder::new(&mut counters, 0, &device))
//!     .unwrap();
//! let y = model.apply(&x, params.initial_weights().tensors()).unwrap();
//! assert_eq!(y.dims(), &[10]);
//! ```

pub mod conv;
pub mod layers;
pub mod mlp;
pub mod model;
pub mod objective;
pub mod params;

pub use conv::{ConvConfig, ConvNet};
pub use layers::{Activation, ConvSpec, Padding};
pub use mlp::{Mlp, MlpConfig};
pub use model::{ModelSpec, ParamFn};
pub use objective::TaskKind;
pub use params::{
    check_structure, FastWeights, Init, NamedParam, ParamBuilder, ParamCursor, ParamList,
    ParamSource,
};

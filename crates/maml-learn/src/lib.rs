//! # maml-learn
//!
//! The bi-level optimization engine of Maml X.
//!
//! ## Key Types
//!
//! - [`InnerLoop`]: per-task gradient descent on fast weights
//! - [`Replica`]: one slot of the meta-batch with its bound task data
//! - [`GradientAggregator`]: sums per-replica meta-gradients
//! - [`MetaLearner`]: train / evaluate over N replicas with one Adam update
//! - [`CheckpointStore`]: safetensors checkpoints of the initial parameters
//! - [`run_train`]: the epoch loop
//!
//! ## Example
//!
//! ```no_run
//! use candle_core::Device;
//! use maml_core::sampling::fixed_count;
//! use maml_learn::{build_learner, MamlConfig};
//!
//! let config = MamlConfig::default();
//! let mut learner = build_learner(&config, &Device::Cpu).unwrap();
//! let loss = learner.train(config.nr_model, fixed_count(10), fixed_count(10)).unwrap();
//! let metrics = learner.evaluate(100, fixed_count(10), fixed_count(10)).unwrap();
//! assert_eq!(metrics.len(), 3);
//! # let _ = loss;
//! ```

pub mod aggregate;
pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod inner;
pub mod meta;
pub mod replica;

pub use aggregate::{AggregatedGradient, GradientAggregator, GradientDevice};
pub use builder::{build_learner, build_learner_with};
pub use checkpoint::CheckpointStore;
pub use config::{CountPolicy, FamilyConfig, MamlConfig};
pub use driver::{run_train, TrainReport, TrainSchedule};
pub use inner::{
    ensure_higher_order_grads, AdaptInputs, GradMode, InnerLoop, InnerLoopConfig, Unroll,
};
pub use meta::{MetaLearner, OuterConfig, EVAL_STEPS};
pub use replica::{Feed, Replica, ReplicaGradient};

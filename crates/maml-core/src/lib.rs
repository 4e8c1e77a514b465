//! # maml-core
//!
//! Foundation types for Maml X, a gradient-based meta-learning (MAML)
//! engine for few-shot regression and classification.
//!
//! ## Key Types
//!
//! - [`MamlError`]: the single error type used across the workspace
//! - [`SimpleRng`]: deterministic splitmix64 generator
//! - [`NameCounters`]: explicit scope-name counters for parameter naming
//! - [`Task`] / [`TaskDistribution`]: the task-sampling collaborator
//! - [`tasks`]: reference task families (sinusoid regression, blobs)
//!
//! ## Architecture Rules
//!
//! - No model or optimizer code here; see `maml-nn` and `maml-learn`.
//! - Tensors produced here live on the CPU; consumers move them.

pub mod error;
pub mod naming;
pub mod rng;
pub mod sampling;
pub mod task;
pub mod tasks;

pub use error::{MamlError, Result};
pub use naming::NameCounters;
pub use rng::SimpleRng;
pub use task::{Task, TaskDistribution, TaskSample};

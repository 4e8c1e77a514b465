//! Reference task families.

pub mod blobs;
pub mod sine;

pub use blobs::{BlobConfig, BlobFamily, BlobTask};
pub use sine::{SineConfig, SineFamily, SineTask};

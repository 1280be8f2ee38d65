//! # cairn-node
//!
//! Process wiring for a cairn peer: configuration, the shared
//! [`NodeContext`] and the adapter that lets the flood overlay search the
//! local bucket.

pub mod config;
pub mod context;
pub mod error;
pub mod index;

pub use config::{KeyMaterial, NodeConfig, RegistryBackend};
pub use context::NodeContext;
pub use error::NodeError;
pub use index::BucketFileIndex;

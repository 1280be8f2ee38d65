//! # cairn-store
//!
//! Per-user encrypted bucket snapshots for cairn.
//!
//! A bucket (chat history, file index) and its two request lists are each
//! serialized to JSON, sealed with the node's [`CryptoEnvelope`], written to
//! an external content-addressable store and referenced by hash from a
//! [`HashRegistry`].  [`BucketStore`] owns the read-modify-write cycle and
//! the merge with peer snapshots.
//!
//! [`CryptoEnvelope`]: cairn_shared::CryptoEnvelope

pub mod bucket;
pub mod content;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod models;
pub mod registry;

mod error;

pub use bucket::{BucketStore, RequestView};
pub use content::{ContentStore, ContentStoreConfig, HttpContentStore};
pub use database::SqliteRegistry;
pub use error::{Result, StoreError};
pub use memory::MemoryContentStore;
pub use models::*;
pub use registry::{
    BucketKind, BucketPointer, HashRegistry, JsonFileRegistry, MemoryRegistry, RegistryEntry,
};

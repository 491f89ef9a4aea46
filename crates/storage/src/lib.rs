//! Storage - Durable storage backends for the orchestration runtime
//!
//! Provides async storage operations with support for:
//! - Local filesystem with atomic writes (`LocalStorage`)
//! - Process memory with fault injection (`MemoryStorage`)
//!
//! The checkpoint commit protocol relies on two properties of every
//! backend: read-after-write consistency for a single path, and
//! create-new semantics for `write_new`.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("ckpt-1/shards/0.shard", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("ckpt-1/shards/0.shard").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod memory;

pub use backend::{StorageBackend, StorageHandle};
pub use local::LocalStorage;
pub use memory::MemoryStorage;

use runtime_core::config::{StorageConfig, StorageKind};
use std::sync::Arc;

/// Build the backend selected by the configuration
pub fn from_config(config: &StorageConfig) -> StorageHandle {
    match config.backend {
        StorageKind::Local => Arc::new(LocalStorage::new(&config.base_path)),
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
    }
}

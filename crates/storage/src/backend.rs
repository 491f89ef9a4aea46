//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;
use std::sync::Arc;

/// Async trait for durable storage backends
///
/// Paths are relative, `/`-separated keys. Every backend must give
/// read-after-write consistency for a single path.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read data from the given path
    ///
    /// # Errors
    /// `StoragePathNotFound` if the path doesn't exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path, replacing any previous content.
    ///
    /// The write is atomic: readers see either the old or the new bytes.
    /// Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Write data only if nothing exists at `path` yet.
    ///
    /// # Errors
    /// `StoragePathExists` if the path is already present
    async fn write_new(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete data at the given path
    ///
    /// # Errors
    /// `StoragePathNotFound` if the path doesn't exist
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Shared handle to a storage backend
pub type StorageHandle = Arc<dyn StorageBackend>;

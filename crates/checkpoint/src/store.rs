//! Durable layout of checkpoints
//!
//! ```text
//! <prefix>/<checkpoint>/shards/<shard>-<digest>.shard   staged, never read without a marker
//! <prefix>/<checkpoint>/COMMIT                           JSON marker, written once
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use runtime_core::{CheckpointId, Epoch, Error, Result, ShardId, WorkerId};
use serde::{Deserialize, Serialize};
use storage::StorageHandle;
use tracing::{debug, instrument, warn};

const MARKER: &str = "COMMIT";

/// Published once every shard of a checkpoint is durable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    pub checkpoint: CheckpointId,
    pub epoch: Epoch,
    pub shards: BTreeMap<ShardId, String>,
    /// Worker that voted each shard
    #[serde(default)]
    pub owners: BTreeMap<ShardId, WorkerId>,
    /// Informational only
    pub committed_at: DateTime<Utc>,
}

impl CommitMarker {
    pub fn new(checkpoint: impl Into<CheckpointId>, epoch: Epoch, shards: BTreeMap<ShardId, String>) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            epoch,
            shards,
            owners: BTreeMap::new(),
            committed_at: Utc::now(),
        }
    }

    pub fn with_owners(mut self, owners: BTreeMap<ShardId, WorkerId>) -> Self {
        self.owners = owners;
        self
    }

    /// Shard written by `worker`, if it took part in the checkpoint
    pub fn shard_of(&self, worker: &str) -> Option<ShardId> {
        self.owners
            .iter()
            .find(|(_, owner)| owner.as_str() == worker)
            .map(|(shard, _)| *shard)
    }
}

/// Storage operations the commit protocol needs
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stage a shard and return its location
    async fn write_shard(&self, checkpoint: &str, shard: ShardId, data: Bytes) -> Result<String>;

    async fn read_shard(&self, location: &str) -> Result<Bytes>;

    async fn delete_shard(&self, location: &str) -> Result<()>;

    /// Every staged shard location of `checkpoint`
    async fn staged_shards(&self, checkpoint: &str) -> Result<Vec<String>>;

    /// Write the marker; fails if one already exists
    async fn publish_commit_marker(&self, marker: &CommitMarker) -> Result<()>;

    async fn read_commit_marker(&self, checkpoint: &str) -> Result<Option<CommitMarker>>;

    async fn delete_commit_marker(&self, checkpoint: &str) -> Result<()>;

    /// Ids with any object in storage, sorted
    async fn list_checkpoints(&self) -> Result<Vec<CheckpointId>>;
}

/// [`CheckpointStore`] over a [`storage::StorageBackend`]
#[derive(Clone)]
pub struct StorageCheckpointStore {
    storage: StorageHandle,
    prefix: String,
}

impl StorageCheckpointStore {
    pub fn new(storage: StorageHandle, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    fn root(&self, checkpoint: &str) -> String {
        format!("{}/{}/", self.prefix, checkpoint)
    }

    fn marker_path(&self, checkpoint: &str) -> String {
        format!("{}{}", self.root(checkpoint), MARKER)
    }

    fn shard_path(&self, checkpoint: &str, shard: ShardId, data: &[u8]) -> String {
        let mut hasher = FnvHasher::default();
        hasher.write(data);
        format!(
            "{}shards/{}-{:016x}.shard",
            self.root(checkpoint),
            shard,
            hasher.finish()
        )
    }
}

impl std::fmt::Debug for StorageCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCheckpointStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl CheckpointStore for StorageCheckpointStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn write_shard(&self, checkpoint: &str, shard: ShardId, data: Bytes) -> Result<String> {
        let path = self.shard_path(checkpoint, shard, &data);
        self.storage.write(&path, data).await?;
        debug!(path = %path, "Shard staged");
        Ok(path)
    }

    async fn read_shard(&self, location: &str) -> Result<Bytes> {
        self.storage.read(location).await
    }

    async fn delete_shard(&self, location: &str) -> Result<()> {
        match self.storage.delete(location).await {
            Ok(()) | Err(Error::StoragePathNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn staged_shards(&self, checkpoint: &str) -> Result<Vec<String>> {
        self.storage
            .list(&format!("{}shards/", self.root(checkpoint)))
            .await
    }

    async fn publish_commit_marker(&self, marker: &CommitMarker) -> Result<()> {
        let json = serde_json::to_vec_pretty(marker)?;
        self.storage
            .write_new(&self.marker_path(&marker.checkpoint), Bytes::from(json))
            .await?;
        Ok(())
    }

    async fn read_commit_marker(&self, checkpoint: &str) -> Result<Option<CommitMarker>> {
        let data = match self.storage.read(&self.marker_path(checkpoint)).await {
            Ok(data) => data,
            Err(Error::StoragePathNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let marker: CommitMarker =
            serde_json::from_slice(&data).map_err(|e| Error::CheckpointCorrupted {
                checkpoint_id: checkpoint.to_string(),
                reason: format!("unreadable marker: {}", e),
            })?;
        if marker.checkpoint != checkpoint {
            return Err(Error::CheckpointCorrupted {
                checkpoint_id: checkpoint.to_string(),
                reason: format!("marker names {}", marker.checkpoint),
            });
        }
        Ok(Some(marker))
    }

    async fn delete_commit_marker(&self, checkpoint: &str) -> Result<()> {
        match self.storage.delete(&self.marker_path(checkpoint)).await {
            Ok(()) | Err(Error::StoragePathNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        let root = format!("{}/", self.prefix);
        let ids: BTreeSet<CheckpointId> = self
            .storage
            .list(&root)
            .await?
            .iter()
            .filter_map(|path| path.strip_prefix(&root))
            .filter_map(|rest| rest.split('/').next())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        Ok(ids.into_iter().collect())
    }
}

/// Remove every staged shard of `checkpoint`, returning how many were deleted
pub(crate) async fn collect_shards(store: &dyn CheckpointStore, checkpoint: &str) -> Result<usize> {
    let staged = store.staged_shards(checkpoint).await?;
    let mut deleted = 0;
    for location in &staged {
        match store.delete_shard(location).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(location = %location, error = %e, "Failed to collect shard"),
        }
    }
    Ok(deleted)
}

/// Delete a committed checkpoint, marker first
pub(crate) async fn delete_checkpoint(store: &dyn CheckpointStore, checkpoint: &str) -> Result<()> {
    store.delete_commit_marker(checkpoint).await?;
    collect_shards(store, checkpoint).await?;
    Ok(())
}

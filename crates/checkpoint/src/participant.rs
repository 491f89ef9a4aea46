//! Worker side of the checkpoint commit protocol

use std::sync::Arc;

use bytes::Bytes;
use runtime_core::{Epoch, Error, Result, ShardId, WorkerId};
use tracing::{info, instrument, warn};

use crate::protocol::CommitCoordinatorHandle;
use crate::store::{CheckpointStore, CommitMarker};

/// Writes one worker's shard and votes on it
#[derive(Clone)]
pub struct CheckpointParticipant {
    worker: WorkerId,
    store: Arc<dyn CheckpointStore>,
    coordinator: CommitCoordinatorHandle,
}

impl CheckpointParticipant {
    pub fn new(
        worker: impl Into<WorkerId>,
        store: Arc<dyn CheckpointStore>,
        coordinator: CommitCoordinatorHandle,
    ) -> Self {
        Self {
            worker: worker.into(),
            store,
            coordinator,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Shard this worker writes: its position in the group
    fn shard_in(&self, epoch: Epoch, members: &[WorkerId]) -> Result<ShardId> {
        members
            .iter()
            .position(|m| *m == self.worker)
            .map(|rank| rank as ShardId)
            .ok_or_else(|| Error::NotAMember {
                epoch,
                worker_id: self.worker.clone(),
            })
    }

    /// Stage `data` as this worker's shard of checkpoint `id`, vote, and
    /// wait for the decision
    ///
    /// `members` is the epoch's collective group in order. Safe to call
    /// again for the same checkpoint: staging is content addressed and a
    /// repeated vote is a no-op.
    #[instrument(skip(self, members, data), fields(worker_id = %self.worker))]
    pub async fn commit_shard(
        &self,
        id: &str,
        epoch: Epoch,
        members: &[WorkerId],
        data: Bytes,
    ) -> Result<CommitMarker> {
        let shard = self.shard_in(epoch, members)?;
        self.coordinator.begin(id, epoch, members)?;

        let location = match self.store.write_shard(id, shard, data).await {
            Ok(location) => Some(location),
            Err(e) => {
                warn!(checkpoint_id = %id, shard, error = %e, "Shard write failed");
                None
            }
        };

        self.coordinator.vote(id, shard, location).await?;
        let marker = self.coordinator.await_decision(id).await?;
        info!(checkpoint_id = %id, shard, "Shard committed");
        Ok(marker)
    }

    /// Vote no for this worker's shard without staging anything
    ///
    /// Used when the shard's contents could not be produced, so the other
    /// participants learn the outcome without waiting for the vote timeout.
    pub async fn decline(&self, id: &str, epoch: Epoch, members: &[WorkerId]) -> Result<()> {
        let shard = self.shard_in(epoch, members)?;
        self.coordinator.begin(id, epoch, members)?;
        self.coordinator.vote(id, shard, None).await?;
        Ok(())
    }
}

impl std::fmt::Debug for CheckpointParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointParticipant")
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use effect_log::EffectLog;
    use runtime_core::config::CheckpointConfig;
    use runtime_core::{CheckpointStatus, Error};
    use storage::{MemoryStorage, StorageBackend};

    use crate::protocol::CommitCoordinator;
    use crate::store::StorageCheckpointStore;

    fn cohort(n: usize, storage: Arc<MemoryStorage>) -> (CommitCoordinatorHandle, Vec<CheckpointParticipant>) {
        let store: Arc<dyn CheckpointStore> =
            Arc::new(StorageCheckpointStore::new(storage, "checkpoints"));
        let config = CheckpointConfig {
            vote_timeout: Duration::from_millis(100),
            ..CheckpointConfig::default()
        };
        let coordinator = Arc::new(CommitCoordinator::new(
            store.clone(),
            config,
            EffectLog::new("coordinator"),
        ));
        let participants = (0..n)
            .map(|i| CheckpointParticipant::new(format!("w{}", i), store.clone(), coordinator.clone()))
            .collect();
        (coordinator, participants)
    }

    async fn run_all(participants: &[CheckpointParticipant], id: &str) -> Vec<Result<CommitMarker>> {
        let members: Vec<WorkerId> = participants.iter().map(|p| p.worker().to_string()).collect();
        let mut tasks = Vec::new();
        for participant in participants {
            let participant = participant.clone();
            let members = members.clone();
            let id = id.to_string();
            tasks.push(tokio::spawn(async move {
                let data = Bytes::from(format!("state of {}", participant.worker()));
                participant.commit_shard(&id, 1, &members, data).await
            }));
        }
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_cohort_commits() {
        let storage = Arc::new(MemoryStorage::new());
        let (coordinator, participants) = cohort(3, storage.clone());

        let results = run_all(&participants, "ckpt-a").await;
        for result in &results {
            assert_eq!(result.as_ref().unwrap().shards.len(), 3);
        }
        let marker = results[0].as_ref().unwrap();
        assert_eq!(marker.shard_of("w2"), Some(2));
        assert_eq!(coordinator.status("ckpt-a"), Some(CheckpointStatus::Committed));
        // Three shards plus the marker
        assert_eq!(storage.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_write_aborts_everyone() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_writes_matching("checkpoints/ckpt-b/shards/1-");
        let (coordinator, participants) = cohort(3, storage.clone());

        let results = run_all(&participants, "ckpt-b").await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(Error::CheckpointAborted { .. }))));
        assert_eq!(coordinator.status("ckpt-b"), Some(CheckpointStatus::Aborted));
        assert!(storage.is_empty());
        assert!(!storage.exists("checkpoints/ckpt-b/COMMIT").await.unwrap());
    }

    #[tokio::test]
    async fn test_decline_aborts_promptly() {
        let storage = Arc::new(MemoryStorage::new());
        let (coordinator, participants) = cohort(2, storage.clone());

        let members = vec!["w0".to_string(), "w1".to_string()];
        participants[1].decline("ckpt-c", 1, &members).await.unwrap();
        assert_eq!(coordinator.status("ckpt-c"), Some(CheckpointStatus::Aborted));

        let err = participants[0]
            .commit_shard("ckpt-c", 1, &members, Bytes::from("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CheckpointAborted { .. }));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_shard_follows_group_order() {
        let storage = Arc::new(MemoryStorage::new());
        let (_, participants) = cohort(3, storage.clone());
        // w1 left the group, so w2 writes shard 1
        let members = vec!["w0".to_string(), "w2".to_string()];

        let (a, b) = tokio::join!(
            participants[0].commit_shard("ckpt-d", 2, &members, Bytes::from("a")),
            participants[2].commit_shard("ckpt-d", 2, &members, Bytes::from("b")),
        );
        let marker = a.unwrap();
        assert_eq!(marker, b.unwrap());
        assert_eq!(marker.shard_of("w2"), Some(1));
        assert!(marker.shards[&1].starts_with("checkpoints/ckpt-d/shards/1-"));

        let err = participants[1]
            .commit_shard("ckpt-d", 2, &members, Bytes::from("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAMember { .. }));
    }
}

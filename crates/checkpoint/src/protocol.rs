//! Coordinator side of the checkpoint commit protocol
//!
//! Collects shard votes, publishes the commit marker once every shard is
//! durable, and collects staged shards of aborted checkpoints. Every input
//! is logged before it is applied; commits and aborts are logged as events.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use effect_log::{EffectLog, ProtocolEvent, ProtocolInput};
use parking_lot::Mutex;
use runtime_core::config::CheckpointConfig;
use runtime_core::{CheckpointId, CheckpointStatus, Epoch, Error, Result, ShardId, WorkerId};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::record::{CheckpointRecord, Decision};
use crate::store::{collect_shards, delete_checkpoint, CheckpointStore, CommitMarker};

/// Deterministic id for the checkpoint taken by `node`
///
/// `generation` counts rollbacks of the run and `attempt` counts openings
/// of the epoch within a generation, so a re-executed epoch never reuses
/// the id of an earlier checkpoint.
pub fn checkpoint_id(generation: u32, epoch: Epoch, attempt: u32, node: &str) -> CheckpointId {
    let node: String = node
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.#".contains(c) { c } else { '_' })
        .collect();
    format!("ckpt-{:08}-{:04}.{}-{}", epoch, generation, attempt, node)
}

struct CheckpointSlot {
    /// Shard `i` is written by `members[i]`
    members: Vec<WorkerId>,
    record: Mutex<CheckpointRecord>,
    status_tx: watch::Sender<CheckpointStatus>,
}

pub struct CommitCoordinator {
    store: Arc<dyn CheckpointStore>,
    config: CheckpointConfig,
    log: EffectLog,
    records: DashMap<CheckpointId, Arc<CheckpointSlot>>,
}

pub type CommitCoordinatorHandle = Arc<CommitCoordinator>;

impl CommitCoordinator {
    pub fn new(store: Arc<dyn CheckpointStore>, config: CheckpointConfig, log: EffectLog) -> Self {
        Self {
            store,
            config,
            log,
            records: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn log(&self) -> &EffectLog {
        &self.log
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    fn find(&self, id: &str) -> Option<Arc<CheckpointSlot>> {
        self.records.get(id).map(|slot| Arc::clone(slot.value()))
    }

    fn slot(&self, id: &str) -> Result<Arc<CheckpointSlot>> {
        self.find(id).ok_or_else(|| Error::CheckpointNotFound {
            checkpoint_id: id.to_string(),
        })
    }

    pub fn status(&self, id: &str) -> Option<CheckpointStatus> {
        self.find(id).map(|slot| slot.record.lock().status())
    }

    pub fn record(&self, id: &str) -> Option<CheckpointRecord> {
        self.find(id).map(|slot| slot.record.lock().clone())
    }

    /// Start tracking `id`, one shard per member in group order
    ///
    /// Repeating with the same arguments is a no-op.
    #[instrument(skip(self, members))]
    pub fn begin(&self, id: &str, epoch: Epoch, members: &[WorkerId]) -> Result<CheckpointStatus> {
        let declared: BTreeSet<ShardId> = (0..members.len() as ShardId).collect();
        match self.records.entry(id.to_string()) {
            Entry::Occupied(existing) => {
                let slot = existing.get();
                let record = slot.record.lock();
                if record.epoch() != epoch || slot.members != members {
                    return Err(Error::assumption(
                        "network.duplicate-consistent",
                        format!(
                            "{} begun for epoch {} with members {:?}, then epoch {} with {:?}",
                            id,
                            record.epoch(),
                            slot.members,
                            epoch,
                            members
                        ),
                    ));
                }
                Ok(record.status())
            }
            Entry::Vacant(vacant) => {
                self.log.input(ProtocolInput::CheckpointBegun {
                    checkpoint: id.to_string(),
                    epoch,
                    shards: declared.iter().copied().collect(),
                });
                let (status_tx, _) = watch::channel(CheckpointStatus::Preparing);
                vacant.insert(Arc::new(CheckpointSlot {
                    members: members.to_vec(),
                    record: Mutex::new(CheckpointRecord::new(id, epoch, declared)),
                    status_tx,
                }));
                info!(checkpoint_id = %id, epoch, shards = members.len(), "Checkpoint begun");
                Ok(CheckpointStatus::Preparing)
            }
        }
    }

    /// Record the vote of `shard`; `None` reports a failed shard write
    #[instrument(skip(self))]
    pub async fn vote(&self, id: &str, shard: ShardId, location: Option<String>) -> Result<CheckpointStatus> {
        let slot = self.slot(id)?;
        let (decision, late) = {
            let mut record = slot.record.lock();
            self.log.input(ProtocolInput::Vote {
                checkpoint: id.to_string(),
                shard,
                location: location.clone(),
            });
            let decision = record.vote(shard, location.clone())?;
            let late = decision.is_none() && record.status() == CheckpointStatus::Aborted;
            (decision, late)
        };

        if late {
            // Garbage collection already ran; collect the straggler too
            if let Some(location) = &location {
                self.store.delete_shard(location).await?;
                debug!(checkpoint_id = %id, shard, "Collected late shard");
            }
        }
        if let Some(decision) = decision {
            self.apply(&slot, id, decision).await;
        }
        let status = slot.record.lock().status();
        Ok(status)
    }

    /// Abort `id` if it is still waiting for votes
    pub async fn expire(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let decision = {
            let mut record = slot.record.lock();
            self.log.input(ProtocolInput::VoteTimeout {
                checkpoint: id.to_string(),
            });
            record.expire()
        };
        if let Some(decision) = decision {
            warn!(checkpoint_id = %id, "Checkpoint vote timed out");
            self.apply(&slot, id, decision).await;
        }
        Ok(())
    }

    async fn apply(&self, slot: &CheckpointSlot, id: &str, decision: Decision) {
        let epoch = slot.record.lock().epoch();
        match decision {
            Decision::Commit { locations } => {
                let owners: BTreeMap<ShardId, WorkerId> = slot
                    .members
                    .iter()
                    .enumerate()
                    .map(|(shard, worker)| (shard as ShardId, worker.clone()))
                    .collect();
                let marker = CommitMarker::new(id, epoch, locations).with_owners(owners);
                match self.store.publish_commit_marker(&marker).await {
                    Ok(()) => {
                        if let Err(e) = slot.record.lock().committed() {
                            warn!(checkpoint_id = %id, error = %e, "Commit state diverged");
                        }
                        self.log.event(
                            None,
                            ProtocolEvent::CheckpointCommitted {
                                checkpoint: id.to_string(),
                                epoch,
                            },
                        );
                        info!(checkpoint_id = %id, epoch, shards = marker.shards.len(), "Checkpoint committed");
                        let _ = slot.status_tx.send(CheckpointStatus::Committed);

                        if let Err(e) = self.enforce_retention().await {
                            warn!(error = %e, "Checkpoint retention failed");
                        }
                    }
                    Err(e) => {
                        let reason = format!("marker publish failed: {}", e);
                        let decision = {
                            let mut record = slot.record.lock();
                            self.log.input(ProtocolInput::PublishFailed {
                                checkpoint: id.to_string(),
                                reason: reason.clone(),
                            });
                            record.publish_failed(reason)
                        };
                        if let Some(Decision::Abort { reason }) = decision {
                            self.abort(slot, id, reason).await;
                        }
                    }
                }
            }
            Decision::Abort { reason } => self.abort(slot, id, reason).await,
        }
    }

    async fn abort(&self, slot: &CheckpointSlot, id: &str, reason: String) {
        self.log.event(
            None,
            ProtocolEvent::CheckpointAborted {
                checkpoint: id.to_string(),
                reason: reason.clone(),
            },
        );
        warn!(checkpoint_id = %id, reason = %reason, "Checkpoint aborted");
        match collect_shards(self.store.as_ref(), id).await {
            Ok(deleted) => info!(checkpoint_id = %id, deleted, "Collected staged shards"),
            Err(e) => warn!(checkpoint_id = %id, error = %e, "Failed to collect staged shards"),
        }
        let _ = slot.status_tx.send(CheckpointStatus::Aborted);
    }

    /// Wait for the decision on `id`, expiring it after the vote timeout
    pub async fn await_decision(&self, id: &str) -> Result<CommitMarker> {
        let slot = self.slot(id)?;
        let mut rx = slot.status_tx.subscribe();
        let timeout = self.config.vote_timeout;

        let settled = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal()))
            .await
            .map(|waited| waited.map(|status| *status));
        let status = match settled {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                return Err(Error::ChannelClosed {
                    channel: format!("checkpoint {} status", id),
                })
            }
            Err(_) => {
                self.expire(id).await?;
                // A commit decided just before expiry may still be publishing
                let settled = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal()))
                    .await
                    .map(|waited| waited.map(|status| *status));
                match settled {
                    Ok(Ok(status)) => status,
                    _ => {
                        return Err(Error::Timeout {
                            operation: format!("checkpoint {} decision", id),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                }
            }
        };

        match status {
            CheckpointStatus::Committed => self.store.read_commit_marker(id).await?.ok_or_else(|| {
                Error::CheckpointCorrupted {
                    checkpoint_id: id.to_string(),
                    reason: "committed without a marker".to_string(),
                }
            }),
            _ => Err(Error::CheckpointAborted {
                checkpoint_id: id.to_string(),
                reason: slot
                    .record
                    .lock()
                    .abort_reason()
                    .unwrap_or("aborted")
                    .to_string(),
            }),
        }
    }

    /// Every committed checkpoint in storage, oldest epoch first
    pub async fn committed(&self) -> Result<Vec<CommitMarker>> {
        let mut markers = Vec::new();
        for id in self.store.list_checkpoints().await? {
            if let Some(marker) = self.store.read_commit_marker(&id).await? {
                markers.push(marker);
            }
        }
        markers.sort_by(|a, b| (a.epoch, &a.checkpoint).cmp(&(b.epoch, &b.checkpoint)));
        Ok(markers)
    }

    pub async fn latest_committed(&self) -> Result<Option<CommitMarker>> {
        Ok(self.committed().await?.pop())
    }

    /// Newest commit taken no later than the last closed epoch
    pub async fn recovery_point(&self, last_closed: Option<Epoch>) -> Result<Option<CommitMarker>> {
        let Some(last_closed) = last_closed else {
            return Ok(None);
        };
        Ok(self
            .committed()
            .await?
            .into_iter()
            .filter(|m| m.epoch <= last_closed)
            .last())
    }

    /// Keep only the newest `keep_count` commits
    pub async fn enforce_retention(&self) -> Result<Vec<CheckpointId>> {
        let committed = self.committed().await?;
        let excess = committed.len().saturating_sub(self.config.keep_count);
        let mut deleted = Vec::with_capacity(excess);
        for marker in committed.into_iter().take(excess) {
            delete_checkpoint(self.store.as_ref(), &marker.checkpoint).await?;
            debug!(checkpoint_id = %marker.checkpoint, epoch = marker.epoch, "Deleted old checkpoint");
            deleted.push(marker.checkpoint);
        }
        Ok(deleted)
    }

    /// Delete commits newer than `epoch`; used when rolling back past them
    pub async fn discard_after(&self, epoch: Option<Epoch>) -> Result<Vec<CheckpointId>> {
        let mut discarded = Vec::new();
        for marker in self.committed().await? {
            if epoch.map_or(true, |e| marker.epoch > e) {
                delete_checkpoint(self.store.as_ref(), &marker.checkpoint).await?;
                info!(checkpoint_id = %marker.checkpoint, epoch = marker.epoch, "Discarded checkpoint past the recovery point");
                discarded.push(marker.checkpoint);
            }
        }
        Ok(discarded)
    }

    /// Collect staged shards of checkpoints that never committed
    ///
    /// Checkpoints still collecting votes are left alone.
    pub async fn collect_garbage(&self) -> Result<Vec<CheckpointId>> {
        let mut collected = Vec::new();
        for id in self.store.list_checkpoints().await? {
            if self.status(&id).is_some_and(|s| !s.is_terminal()) {
                continue;
            }
            if self.store.read_commit_marker(&id).await?.is_some() {
                continue;
            }
            if collect_shards(self.store.as_ref(), &id).await? > 0 {
                collected.push(id);
            }
        }
        if !collected.is_empty() {
            info!(checkpoints = ?collected, "Collected uncommitted checkpoints");
        }
        Ok(collected)
    }

    /// Read one shard of a committed checkpoint
    pub async fn load_shard(&self, marker: &CommitMarker, shard: ShardId) -> Result<Bytes> {
        let location = marker
            .shards
            .get(&shard)
            .ok_or_else(|| Error::CheckpointCorrupted {
                checkpoint_id: marker.checkpoint.clone(),
                reason: format!("marker has no shard {}", shard),
            })?;
        match self.store.read_shard(location).await {
            Err(Error::StoragePathNotFound { path }) => Err(Error::CheckpointCorrupted {
                checkpoint_id: marker.checkpoint.clone(),
                reason: format!("shard {} missing at {}", shard, path),
            }),
            other => other,
        }
    }
}

impl std::fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("tracked", &self.records.len())
            .field("keep_count", &self.config.keep_count)
            .finish()
    }
}

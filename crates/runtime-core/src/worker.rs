//! Worker liveness registry
//!
//! Tracks which workers of the manifest are alive. The coordinator uses it
//! to compute the candidate set of each epoch and to detect failures that
//! must abort an in-progress epoch.

use crate::{Epoch, Error, Result, WorkerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Worker state enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerState {
    /// Registered, not yet part of an epoch
    Joining,

    /// Executing epochs
    Active,

    /// Draining after a local failure
    Cleanup,

    /// Reported a terminal failure
    Failed,

    /// Missed heartbeats
    Dead,

    /// Left the cohort gracefully
    Left,
}

impl WorkerState {
    /// Returns true if the worker can take part in a new epoch
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Joining | WorkerState::Active)
    }
}

/// Worker information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique worker identifier
    pub id: WorkerId,

    /// Position in the manifest ordering
    pub rank: u32,

    /// Current state
    pub state: WorkerState,

    /// Last heartbeat timestamp
    pub last_heartbeat: DateTime<Utc>,

    /// Registration timestamp
    pub registered_at: DateTime<Utc>,

    /// Last epoch the worker reported
    pub current_epoch: Epoch,
}

impl WorkerInfo {
    /// Create a new worker info
    pub fn new(id: WorkerId, rank: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            rank,
            state: WorkerState::Joining,
            last_heartbeat: now,
            registered_at: now,
            current_epoch: 0,
        }
    }

    /// Check if worker is considered dead based on timeout
    pub fn is_dead(&self, timeout: Duration) -> bool {
        let elapsed = Utc::now()
            .signed_duration_since(self.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed > timeout
    }
}

/// Thread-safe worker registry
pub struct WorkerRegistry {
    /// Map of worker ID to worker info
    workers: DashMap<WorkerId, WorkerInfo>,

    /// Heartbeat timeout duration
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    /// Create a new worker registry
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            heartbeat_timeout,
        }
    }

    /// Register a worker at its manifest rank
    pub fn register(&self, worker_id: &str, rank: u32) -> Result<WorkerInfo> {
        if let Some(existing) = self.workers.get(worker_id) {
            if existing.state.is_live() {
                return Err(Error::WorkerAlreadyRegistered {
                    worker_id: worker_id.to_string(),
                });
            }
        }

        let info = WorkerInfo::new(worker_id.to_string(), rank);
        info!(worker_id = %worker_id, rank = rank, "Worker registered");
        self.workers.insert(worker_id.to_string(), info.clone());
        Ok(info)
    }

    /// Deregister a worker
    pub fn deregister(&self, worker_id: &str) -> Result<WorkerInfo> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })?;
        worker.state = WorkerState::Left;
        info!(worker_id = %worker_id, "Worker deregistered");
        Ok(worker.clone())
    }

    /// Get worker info by ID
    pub fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.get(worker_id).map(|w| w.clone())
    }

    /// Record a heartbeat
    pub fn heartbeat(&self, worker_id: &str, state: WorkerState, epoch: Epoch) -> Result<()> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })?;

        if worker.state == WorkerState::Dead {
            warn!(worker_id = %worker_id, "Heartbeat from worker already declared dead");
            return Err(Error::assumption(
                "network.failure-detection",
                format!("worker {} sent a heartbeat after being declared dead", worker_id),
            ));
        }

        worker.last_heartbeat = Utc::now();
        // A failed or draining worker stays out of new epochs until it re-registers
        if worker.state.is_live() {
            worker.state = state;
        }
        worker.current_epoch = epoch;
        Ok(())
    }

    /// Mark a worker with a terminal or cleanup state
    pub fn set_state(&self, worker_id: &str, state: WorkerState) -> Result<()> {
        let mut worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })?;
        worker.state = state;
        Ok(())
    }

    /// Whether a worker may take part in a new epoch
    pub fn is_live(&self, worker_id: &str) -> bool {
        self.workers
            .get(worker_id)
            .map(|w| w.state.is_live())
            .unwrap_or(false)
    }

    /// Live workers ordered by rank
    pub fn live_workers(&self) -> Vec<WorkerInfo> {
        let mut live: Vec<_> = self
            .workers
            .iter()
            .filter(|entry| entry.value().state.is_live())
            .map(|entry| entry.value().clone())
            .collect();
        live.sort_by_key(|w| w.rank);
        live
    }

    /// Number of registered workers in any state
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Check for dead workers and mark them
    pub fn check_dead_workers(&self) -> Vec<WorkerId> {
        let mut dead_workers = Vec::new();

        for mut entry in self.workers.iter_mut() {
            let worker = entry.value();
            if worker.state.is_live() && worker.is_dead(self.heartbeat_timeout) {
                warn!(
                    worker_id = %entry.key(),
                    last_heartbeat = ?worker.last_heartbeat,
                    "Worker marked as dead"
                );
                entry.value_mut().state = WorkerState::Dead;
                dead_workers.push(entry.key().clone());
            }
        }

        dead_workers.sort();
        dead_workers
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Thread-safe handle to worker registry
pub type WorkerRegistryHandle = Arc<WorkerRegistry>;

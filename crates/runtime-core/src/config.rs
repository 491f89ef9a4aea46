//! Runtime configuration types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Graph builder limits
    pub builder: BuilderConfig,

    /// Device/stream topology used for queue assignment
    pub topology: TopologyConfig,

    /// Resource manager settings
    pub resource: ResourceConfig,

    /// Coordinator settings
    pub coordinator: CoordinatorConfig,

    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Storage settings
    pub storage: StorageConfig,

    /// Effect log settings
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Load a JSON configuration file; missing sections take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(Error::InvalidConfig {
                message: message.to_string(),
            })
        };

        if self.topology.devices == 0 {
            return invalid("topology.devices must be at least 1");
        }
        if self.topology.compute_streams == 0 || self.topology.copy_streams == 0 {
            return invalid("topology stream counts must be at least 1");
        }
        if self.resource.max_handles == 0 {
            return invalid("resource.max_handles must be at least 1");
        }
        if self.builder.max_nodes == 0 {
            return invalid("builder.max_nodes must be at least 1");
        }
        if self.checkpoint.keep_count == 0 {
            return invalid("checkpoint.keep_count must be at least 1");
        }
        if self.coordinator.agreement_timeout.is_zero()
            || self.coordinator.close_timeout.is_zero()
            || self.checkpoint.vote_timeout.is_zero()
        {
            return invalid("barrier timeouts must be non-zero");
        }
        if self.coordinator.heartbeat_interval.is_zero()
            || self.coordinator.heartbeat_interval >= self.coordinator.heartbeat_timeout
        {
            return invalid("coordinator.heartbeat_interval must be non-zero and below heartbeat_timeout");
        }
        Ok(())
    }
}

/// Bounds that keep workflow expansion finite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Largest iteration count accepted by a `repeat` step
    pub max_repeat: u32,

    /// Deepest nesting of `repeat`/`include` steps
    pub max_depth: usize,

    /// Largest number of nodes after expansion
    pub max_nodes: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_repeat: 10_000,
            max_depth: 16,
            max_nodes: 1_000_000,
        }
    }
}

/// Fixed worker/device topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Devices visible to each worker
    pub devices: u32,

    /// Compute streams per device
    pub compute_streams: u32,

    /// Copy streams per device
    pub copy_streams: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            compute_streams: 2,
            copy_streams: 1,
        }
    }
}

/// Resource manager limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Total bytes a worker may hold in live handles
    pub capacity_bytes: u64,

    /// Maximum number of live handles
    pub max_handles: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 16 * 1024 * 1024 * 1024, // 16GB
            max_handles: 65_536,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long the Agreed barrier waits for membership proposals
    #[serde(with = "humantime_serde")]
    pub agreement_timeout: Duration,

    /// How long the Closed barrier waits for step reports
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,

    /// Worker heartbeat timeout
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// How often a worker refreshes its heartbeat while in an epoch
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// How often to check for dead workers
    #[serde(with = "humantime_serde")]
    pub liveness_check_interval: Duration,

    /// Rollbacks allowed before a run gives up
    pub max_rollbacks: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agreement_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(300),
            heartbeat_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            liveness_check_interval: Duration::from_secs(5),
            max_rollbacks: 3,
        }
    }
}

impl CoordinatorConfig {
    /// Heartbeat period actually used by workers
    ///
    /// Capped at a third of the timeout so two lost heartbeats in a row
    /// still do not get a worker declared dead.
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval
            .min(self.heartbeat_timeout / 3)
            .max(Duration::from_millis(1))
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// How long the Voted barrier waits for every shard vote
    #[serde(with = "humantime_serde")]
    pub vote_timeout: Duration,

    /// Number of committed checkpoints to keep
    pub keep_count: usize,

    /// Storage prefix for checkpoint objects
    pub prefix: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            vote_timeout: Duration::from_secs(120),
            keep_count: 5,
            prefix: "checkpoints".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type
    pub backend: StorageKind,

    /// Base path for local storage
    pub base_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Local,
            base_path: "./data".to_string(),
        }
    }
}

/// Storage backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Local filesystem
    Local,

    /// Process memory (tests and dry runs)
    Memory,
}

/// Effect log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory where finished logs are persisted, if any
    pub persist_dir: Option<String>,

    /// Buffered entries per live-tail subscriber
    pub tail_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            persist_dir: None,
            tail_capacity: 1024,
        }
    }
}

/// Duration serialization helper (milliseconds)
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

//! Core type definitions shared across the runtime

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier types
pub type WorkerId = String;
pub type CheckpointId = String;
pub type RunId = String;
pub type ShardId = u32;

/// Logical epoch counter shared by a worker cohort
pub type Epoch = u64;

/// Position in an effect log
pub type Seq = u64;

/// Index of an effect node inside one workflow graph.
///
/// Assigned by the graph builder in expanded program order, so it doubles
/// as the canonical tie-break key for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Kind of effect a workflow node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    /// Allocate a device-resident resource
    Alloc,

    /// Release a device-resident resource
    Free,

    /// Move data between resources
    Copy,

    /// Run a compute kernel
    Compute,

    /// Cross-worker communication (all-reduce, broadcast)
    Collective,

    /// Contribute a shard to a checkpoint
    Checkpoint,

    /// Local ordering point with no device work
    Barrier,
}

impl EffectKind {
    /// Effects that may still run once the runtime is in cleanup mode
    pub fn is_cleanup(&self) -> bool {
        matches!(self, EffectKind::Free)
    }

    /// Effects executed by the backend rather than by the resource manager
    pub fn needs_backend(&self) -> bool {
        matches!(
            self,
            EffectKind::Copy | EffectKind::Compute | EffectKind::Collective | EffectKind::Checkpoint
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Alloc => "alloc",
            EffectKind::Free => "free",
            EffectKind::Copy => "copy",
            EffectKind::Compute => "compute",
            EffectKind::Collective => "collective",
            EffectKind::Checkpoint => "checkpoint",
            EffectKind::Barrier => "barrier",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of device resource a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Buffer,
    Command,
    Stream,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Buffer => f.write_str("buffer"),
            ResourceClass::Command => f.write_str("command"),
            ResourceClass::Stream => f.write_str("stream"),
        }
    }
}

/// Process-wide execution mode of one runtime context.
///
/// Transitions are monotone: `Running -> Cleanup -> {Done, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Effects are being executed
    Running,

    /// Draining in-flight work and releasing handles; only cleanup effects run
    Cleanup,

    /// Terminal: the run failed
    Failed,

    /// Terminal: the run completed
    Done,
}

impl ExecutionMode {
    pub fn can_transition_to(&self, next: ExecutionMode) -> bool {
        matches!(
            (self, next),
            (ExecutionMode::Running, ExecutionMode::Cleanup)
                | (ExecutionMode::Cleanup, ExecutionMode::Done)
                | (ExecutionMode::Cleanup, ExecutionMode::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionMode::Failed | ExecutionMode::Done)
    }

    /// Whether an effect of `kind` may be executed in this mode
    pub fn permits(&self, kind: EffectKind) -> bool {
        match self {
            ExecutionMode::Running => true,
            ExecutionMode::Cleanup => kind.is_cleanup(),
            ExecutionMode::Failed | ExecutionMode::Done => false,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a collective operation synchronizes its participants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveMode {
    /// Barrier-synchronous; eligible for the reproducibility guarantee
    #[default]
    Synchronous,

    /// Overlapped with compute; carries no determinism claim
    Asynchronous,
}

/// Lifecycle phase of one epoch in the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpochPhase {
    Forming,
    Agreed,
    Executing,
    Closing,
    Closed,
    Aborted,
}

impl EpochPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EpochPhase::Closed | EpochPhase::Aborted)
    }
}

impl fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Commit status of a checkpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointStatus {
    Preparing,
    Voted,
    Committed,
    Aborted,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Committed | CheckpointStatus::Aborted)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome reported for a submitted effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Succeeded,
    Failed { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_transitions() {
        assert!(ExecutionMode::Running.can_transition_to(ExecutionMode::Cleanup));
        assert!(ExecutionMode::Cleanup.can_transition_to(ExecutionMode::Done));
        assert!(ExecutionMode::Cleanup.can_transition_to(ExecutionMode::Failed));

        assert!(!ExecutionMode::Running.can_transition_to(ExecutionMode::Done));
        assert!(!ExecutionMode::Done.can_transition_to(ExecutionMode::Running));
        assert!(!ExecutionMode::Failed.can_transition_to(ExecutionMode::Cleanup));
    }

    #[test]
    fn test_cleanup_only_permits_free() {
        assert!(ExecutionMode::Cleanup.permits(EffectKind::Free));
        assert!(!ExecutionMode::Cleanup.permits(EffectKind::Compute));
        assert!(!ExecutionMode::Cleanup.permits(EffectKind::Alloc));
        assert!(!ExecutionMode::Done.permits(EffectKind::Free));
        assert!(ExecutionMode::Running.permits(EffectKind::Collective));
    }

    #[test]
    fn test_effect_kind_serde_names() {
        let json = serde_json::to_string(&EffectKind::Collective).unwrap();
        assert_eq!(json, "\"collective\"");
        let parsed: EffectKind = serde_json::from_str("\"free\"").unwrap();
        assert_eq!(parsed, EffectKind::Free);
    }
}

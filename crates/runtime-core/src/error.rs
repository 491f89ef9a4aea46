//! Error taxonomy for the orchestration runtime
//!
//! Every error belongs to one [`ErrorClass`]. The class decides how the
//! runtime reacts: resource errors and assumption violations end the run,
//! protocol errors abort the current epoch or checkpoint and roll back,
//! backend errors push the runtime into cleanup mode.

use crate::types::{Epoch, EpochPhase, ExecutionMode, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomy class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Handle lifecycle violations and exhaustion; fatal to the run
    Resource,

    /// Membership, vote and epoch failures; abort and roll back
    Protocol,

    /// Failures reported by the execution backend; force cleanup
    Backend,

    /// Observed behavior contradicts a documented assumption; fatal
    AssumptionViolation,

    /// Invalid graph, configuration or manifest
    Config,

    /// Durable storage failures
    Storage,

    /// Bugs and broken plumbing
    Internal,
}

impl ErrorClass {
    /// Process exit code used by binaries for a terminal error of this class
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorClass::Resource => 10,
            ErrorClass::Protocol => 11,
            ErrorClass::Backend => 12,
            ErrorClass::AssumptionViolation => 13,
            ErrorClass::Config => 14,
            ErrorClass::Storage => 15,
            ErrorClass::Internal => 16,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            ErrorClass::Resource => "RES",
            ErrorClass::Protocol => "PRO",
            ErrorClass::Backend => "BKD",
            ErrorClass::AssumptionViolation => "ASM",
            ErrorClass::Config => "CFG",
            ErrorClass::Storage => "STO",
            ErrorClass::Internal => "INT",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Core error type for the orchestration runtime
#[derive(Error, Debug)]
pub enum Error {
    // Resource errors
    #[error("Resource exhausted: requested {requested} bytes, {available} available ({live_handles} live handles)")]
    ResourceExhausted {
        requested: u64,
        available: u64,
        live_handles: usize,
    },

    #[error("Use after free or double free: {handle} is {state}")]
    UseAfterFreeOrDoubleFree { handle: String, state: String },

    #[error("Invalid footprint for {node}: {handle} {reason}")]
    InvalidFootprint {
        node: NodeId,
        handle: String,
        reason: String,
    },

    #[error("Handle {handle} is owned by {owner}, not {worker}")]
    ForeignHandle {
        handle: String,
        owner: String,
        worker: String,
    },

    #[error("Unbound handle '{name}' referenced by {node}")]
    UnboundHandle { node: NodeId, name: String },

    // Graph and configuration errors
    #[error("Malformed graph: {reason}")]
    MalformedGraph { reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Manifest mismatch: {field} pinned to {expected}, found {actual}")]
    ManifestMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    // Protocol errors
    #[error("Epoch {epoch} aborted: {reason}")]
    EpochAborted { epoch: Epoch, reason: String },

    #[error("Epoch {epoch} timed out in {phase} after {timeout_ms}ms")]
    EpochTimeout {
        epoch: Epoch,
        phase: EpochPhase,
        timeout_ms: u64,
    },

    #[error("Epoch {epoch} cannot move from {from} to {to}")]
    InvalidEpochTransition {
        epoch: Epoch,
        from: EpochPhase,
        to: EpochPhase,
    },

    #[error("Epoch {epoch} is out of order (expected {expected})")]
    EpochOutOfOrder { epoch: Epoch, expected: Epoch },

    #[error("Worker {worker_id} is not a member of epoch {epoch}")]
    NotAMember { epoch: Epoch, worker_id: String },

    #[error("Checkpoint vote failed: {checkpoint_id} shard {shard}: {reason}")]
    CheckpointVoteFailed {
        checkpoint_id: String,
        shard: u32,
        reason: String,
    },

    #[error("Checkpoint aborted: {checkpoint_id} - {reason}")]
    CheckpointAborted {
        checkpoint_id: String,
        reason: String,
    },

    #[error("Checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    #[error("Checkpoint corrupted: {checkpoint_id} - {reason}")]
    CheckpointCorrupted {
        checkpoint_id: String,
        reason: String,
    },

    #[error("No committed checkpoint available for recovery")]
    NoCheckpointForRecovery,

    #[error("Worker not found: {worker_id}")]
    WorkerNotFound { worker_id: String },

    #[error("Worker already registered: {worker_id}")]
    WorkerAlreadyRegistered { worker_id: String },

    // Backend errors
    #[error("Backend failure on {node}: {message}")]
    Backend { node: NodeId, message: String },

    #[error("Execution halted in {mode} mode: refused {operation}")]
    ExecutionHalted {
        mode: ExecutionMode,
        operation: String,
    },

    // Assumption violations
    #[error("Assumption violated [{assumption}]: {detail}")]
    AssumptionViolation { assumption: String, detail: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    #[error("Storage path already exists: {path}")]
    StoragePathExists { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl Error {
    /// Shorthand for an assumption violation
    pub fn assumption(assumption: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::AssumptionViolation {
            assumption: assumption.into(),
            detail: detail.into(),
        }
    }

    /// Shorthand for a malformed graph
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedGraph {
            reason: reason.into(),
        }
    }

    /// Taxonomy class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ResourceExhausted { .. }
            | Error::UseAfterFreeOrDoubleFree { .. }
            | Error::InvalidFootprint { .. }
            | Error::ForeignHandle { .. }
            | Error::UnboundHandle { .. } => ErrorClass::Resource,

            Error::MalformedGraph { .. }
            | Error::InvalidConfig { .. }
            | Error::ManifestMismatch { .. } => ErrorClass::Config,

            Error::EpochAborted { .. }
            | Error::EpochTimeout { .. }
            | Error::InvalidEpochTransition { .. }
            | Error::EpochOutOfOrder { .. }
            | Error::NotAMember { .. }
            | Error::CheckpointVoteFailed { .. }
            | Error::CheckpointAborted { .. }
            | Error::CheckpointNotFound { .. }
            | Error::CheckpointCorrupted { .. }
            | Error::NoCheckpointForRecovery
            | Error::WorkerNotFound { .. }
            | Error::WorkerAlreadyRegistered { .. } => ErrorClass::Protocol,

            Error::Backend { .. } | Error::ExecutionHalted { .. } => ErrorClass::Backend,

            Error::AssumptionViolation { .. } => ErrorClass::AssumptionViolation,

            Error::Storage { .. }
            | Error::StoragePathNotFound { .. }
            | Error::StoragePathExists { .. }
            | Error::Io(_)
            | Error::Serialization(_) => ErrorClass::Storage,

            Error::Internal { .. } | Error::Timeout { .. } | Error::ChannelClosed { .. } => {
                ErrorClass::Internal
            }
        }
    }

    /// Stable structured code, e.g. `RES-002`
    pub fn code(&self) -> String {
        let number = match self {
            Error::ResourceExhausted { .. } => 1,
            Error::UseAfterFreeOrDoubleFree { .. } => 2,
            Error::InvalidFootprint { .. } => 3,
            Error::ForeignHandle { .. } => 4,
            Error::UnboundHandle { .. } => 5,
            Error::MalformedGraph { .. } => 1,
            Error::InvalidConfig { .. } => 2,
            Error::ManifestMismatch { .. } => 3,
            Error::EpochAborted { .. } => 1,
            Error::EpochTimeout { .. } => 2,
            Error::InvalidEpochTransition { .. } => 3,
            Error::EpochOutOfOrder { .. } => 4,
            Error::NotAMember { .. } => 5,
            Error::CheckpointVoteFailed { .. } => 6,
            Error::CheckpointAborted { .. } => 7,
            Error::CheckpointNotFound { .. } => 8,
            Error::CheckpointCorrupted { .. } => 9,
            Error::NoCheckpointForRecovery => 10,
            Error::WorkerNotFound { .. } => 11,
            Error::WorkerAlreadyRegistered { .. } => 12,
            Error::Backend { .. } => 1,
            Error::ExecutionHalted { .. } => 2,
            Error::AssumptionViolation { .. } => 1,
            Error::Storage { .. } => 1,
            Error::StoragePathNotFound { .. } => 2,
            Error::StoragePathExists { .. } => 3,
            Error::Io(_) => 4,
            Error::Serialization(_) => 5,
            Error::Internal { .. } => 1,
            Error::Timeout { .. } => 2,
            Error::ChannelClosed { .. } => 3,
        };
        format!("{}-{:03}", self.class().prefix(), number)
    }

    /// Returns true if this error may be retried at the next epoch
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Protocol | ErrorClass::Storage)
            && !matches!(self, Error::CheckpointCorrupted { .. })
    }

    /// Returns true if this error ends the run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Resource
                | ErrorClass::AssumptionViolation
                | ErrorClass::Config
                | ErrorClass::Internal
        ) || matches!(self, Error::CheckpointCorrupted { .. })
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::EpochTimeout { .. } => Some(1000),
            Error::EpochAborted { .. } => Some(500),
            Error::CheckpointVoteFailed { .. } | Error::CheckpointAborted { .. } => Some(500),
            Error::Storage { .. } => Some(100),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = Error::UseAfterFreeOrDoubleFree {
            handle: "h3v1".to_string(),
            state: "Freed".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Resource);
        assert!(err.is_fatal());
        assert!(!err.is_retryable());

        let err = Error::EpochTimeout {
            epoch: 4,
            phase: EpochPhase::Forming,
            timeout_ms: 5000,
        };
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        let err = Error::assumption("membership.identical-proposals", "w1 disagrees");
        assert_eq!(err.class(), ErrorClass::AssumptionViolation);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_codes() {
        let err = Error::ResourceExhausted {
            requested: 10,
            available: 5,
            live_handles: 2,
        };
        assert_eq!(err.code(), "RES-001");

        let err = Error::Backend {
            node: NodeId(7),
            message: "kernel fault".to_string(),
        };
        assert_eq!(err.code(), "BKD-001");
        assert_eq!(err.class().exit_code(), 12);
    }

    #[test]
    fn test_corrupted_checkpoint_is_fatal() {
        let err = Error::CheckpointCorrupted {
            checkpoint_id: "ckpt-1".to_string(),
            reason: "marker unreadable".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }
}

//! Log entry types

use std::fmt;

use runtime_core::{
    CheckpointId, EffectKind, Epoch, EpochPhase, ExecutionMode, NodeId, Outcome, Seq, ShardId,
    WorkerId,
};
use serde::{Deserialize, Serialize};

/// Input delivered to a protocol machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolInput {
    EpochOpened {
        epoch: Epoch,
        candidates: Vec<WorkerId>,
    },
    Proposal {
        epoch: Epoch,
        worker: WorkerId,
        membership: Vec<WorkerId>,
    },
    StepReported {
        epoch: Epoch,
        worker: WorkerId,
    },
    Collective {
        epoch: Epoch,
        worker: WorkerId,
        operation: String,
    },
    WorkerFailed {
        epoch: Epoch,
        worker: WorkerId,
    },
    Timeout {
        epoch: Epoch,
        phase: EpochPhase,
    },
    CheckpointBegun {
        checkpoint: CheckpointId,
        epoch: Epoch,
        shards: Vec<ShardId>,
    },
    /// `location` is `None` for a failed shard write
    Vote {
        checkpoint: CheckpointId,
        shard: ShardId,
        location: Option<String>,
    },
    VoteTimeout {
        checkpoint: CheckpointId,
    },
    /// The commit marker could not be published
    PublishFailed {
        checkpoint: CheckpointId,
        reason: String,
    },
    /// A worker starts executing its step
    StepStarted { epoch: Epoch },
    /// A worker was told to stop; `None` for a normal finish
    Halted { reason: Option<String> },
}

/// Observable protocol-level transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolEvent {
    Allocated { handle: String },
    Freed { handle: String },
    ModeChanged { from: ExecutionMode, to: ExecutionMode },
    EpochTransition { epoch: Epoch, phase: EpochPhase },
    CheckpointCommitted { checkpoint: CheckpointId, epoch: Epoch },
    CheckpointAborted { checkpoint: CheckpointId, reason: String },
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolEvent::Allocated { handle } => write!(f, "alloc {}", handle),
            ProtocolEvent::Freed { handle } => write!(f, "free {}", handle),
            ProtocolEvent::ModeChanged { from, to } => write!(f, "mode {} -> {}", from, to),
            ProtocolEvent::EpochTransition { epoch, phase } => {
                write!(f, "epoch {} {}", epoch, phase)
            }
            ProtocolEvent::CheckpointCommitted { checkpoint, epoch } => {
                write!(f, "commit {} @{}", checkpoint, epoch)
            }
            ProtocolEvent::CheckpointAborted { checkpoint, reason } => {
                write!(f, "abort {} ({})", checkpoint, reason)
            }
        }
    }
}

/// Payload of one log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// Written before a transition is applied
    Intent { kind: EffectKind, footprint: u64 },

    /// Written once the transition's result is known
    Outcome { kind: EffectKind, outcome: Outcome },

    Input(ProtocolInput),

    Event(ProtocolEvent),
}

/// One entry of an effect log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: Seq,
    pub node: Option<NodeId>,
    pub record: Record,
}

impl LogEntry {
    pub fn event(&self) -> Option<&ProtocolEvent> {
        match &self.record {
            Record::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn input(&self) -> Option<&ProtocolInput> {
        match &self.record {
            Record::Input(input) => Some(input),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.record {
            Record::Outcome { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

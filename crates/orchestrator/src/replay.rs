//! Replay of recorded effect logs
//!
//! Two reference interpreters re-derive the protocol events a log should
//! contain and compare them with the events actually recorded:
//!
//! - the worker interpreter walks the canonical schedule the way the
//!   executor does, taking backend outcomes from the log as its oracle,
//!   and derives allocations, frees and mode changes;
//! - the coordinator interpreter feeds the recorded inputs to fresh epoch
//!   and checkpoint state machines and derives their transitions.
//!
//! Numeric results are never compared, only protocol-level events.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use checkpoint::{CheckpointRecord, Decision};
use coordinator::EpochRecord;
use effect_log::{EffectLog, LogEntry, ProtocolEvent, ProtocolInput, Record};
use runtime_core::{
    CheckpointId, EffectKind, Epoch, EpochPhase, Error, ExecutionMode, NodeId, Outcome, Result,
};
use serde::Serialize;
use tracing::{debug, warn};
use workflow::{Schedule, Scheduler, WorkflowGraph};

use crate::job::{CohortJob, JobReport};

/// First point where the derived and recorded events disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub index: usize,
    pub expected: Option<ProtocolEvent>,
    pub actual: Option<ProtocolEvent>,
}

/// Result of replaying one event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub stream: String,
    /// Events that matched before the first divergence
    pub compared: usize,
    pub divergence: Option<Divergence>,
}

impl ReplayReport {
    fn compare(stream: impl Into<String>, expected: &[ProtocolEvent], actual: &[ProtocolEvent]) -> Self {
        let matching = expected
            .iter()
            .zip(actual)
            .take_while(|(e, a)| e == a)
            .count();
        let divergence = (matching < expected.len().max(actual.len())).then(|| Divergence {
            index: matching,
            expected: expected.get(matching).cloned(),
            actual: actual.get(matching).cloned(),
        });
        Self {
            stream: stream.into(),
            compared: matching,
            divergence,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.divergence.is_none()
    }

    /// Turn a divergence into an error
    pub fn into_result(self) -> Result<Self> {
        match &self.divergence {
            None => Ok(self),
            Some(_) => Err(Error::Internal {
                message: format!("replay diverged: {}", self),
            }),
        }
    }
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.divergence {
            None => write!(f, "{}: {} events consistent", self.stream, self.compared),
            Some(d) => write!(
                f,
                "{}: diverged at event {}: expected {:?}, recorded {:?}",
                self.stream, d.index, d.expected, d.actual
            ),
        }
    }
}

/// Replay one worker incarnation's log against `graph` and `schedule`
pub fn replay_worker(graph: &WorkflowGraph, schedule: &Schedule, log: &EffectLog) -> ReplayReport {
    let entries: Vec<LogEntry> = log.cursor().collect();
    let actual: Vec<ProtocolEvent> = entries
        .iter()
        .filter_map(LogEntry::event)
        .filter(|e| {
            matches!(
                e,
                ProtocolEvent::Allocated { .. } | ProtocolEvent::Freed { .. } | ProtocolEvent::ModeChanged { .. }
            )
        })
        .cloned()
        .collect();

    let mut model = WorkerModel::new(graph, schedule);
    for (at, entry) in entries.iter().enumerate() {
        match entry.input() {
            Some(ProtocolInput::StepStarted { epoch }) => {
                let rest = &entries[at + 1..];
                let end = rest
                    .iter()
                    .position(|e| {
                        matches!(
                            e.input(),
                            Some(ProtocolInput::StepStarted { .. } | ProtocolInput::Halted { .. })
                        )
                    })
                    .unwrap_or(rest.len());
                if !model.step(*epoch, &Oracle::from_segment(&rest[..end])) {
                    break;
                }
            }
            Some(ProtocolInput::Halted { reason }) => model.halt(reason.is_some()),
            _ => {}
        }
    }

    ReplayReport::compare(log.name(), &model.events, &actual)
}

/// Backend outcomes recorded during one step
#[derive(Debug, Default)]
struct Oracle {
    submitted: HashSet<NodeId>,
    outcomes: HashMap<NodeId, Outcome>,
}

impl Oracle {
    fn from_segment(segment: &[LogEntry]) -> Self {
        let mut oracle = Oracle::default();
        for entry in segment {
            let Some(node) = entry.node else {
                continue;
            };
            match &entry.record {
                Record::Intent { .. } => {
                    oracle.submitted.insert(node);
                }
                Record::Outcome { outcome, .. } => {
                    oracle.outcomes.entry(node).or_insert_with(|| outcome.clone());
                }
                _ => {}
            }
        }
        oracle
    }
}

/// How a simulated step ended
enum StepEnd {
    Finished,
    Failed,
    /// The log stops before the step's outcome is known
    Truncated,
}

struct WorkerModel<'a> {
    graph: &'a WorkflowGraph,
    schedule: &'a Schedule,
    mode: ExecutionMode,
    failed: bool,
    /// Labels of live handles, oldest allocation first
    live: Vec<String>,
    events: Vec<ProtocolEvent>,
}

impl<'a> WorkerModel<'a> {
    fn new(graph: &'a WorkflowGraph, schedule: &'a Schedule) -> Self {
        Self {
            graph,
            schedule,
            mode: ExecutionMode::Running,
            failed: false,
            live: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Simulate one step; false once nothing further can be derived
    fn step(&mut self, epoch: Epoch, oracle: &Oracle) -> bool {
        if self.mode != ExecutionMode::Running {
            warn!(epoch, mode = %self.mode, "Step recorded outside running mode");
            return false;
        }
        match self.walk(oracle) {
            StepEnd::Finished => {
                self.release();
                true
            }
            StepEnd::Failed => {
                self.failed = true;
                self.enter_cleanup();
                self.release();
                self.finish();
                true
            }
            StepEnd::Truncated => {
                debug!(epoch, "Log ends inside a step");
                false
            }
        }
    }

    fn walk(&mut self, oracle: &Oracle) -> StepEnd {
        let mut pending: VecDeque<(NodeId, Outcome)> = VecDeque::new();
        let mut settled = vec![false; self.graph.len()];

        for entry in self.schedule.iter() {
            let Some(node) = self.graph.node(entry.node) else {
                return StepEnd::Truncated;
            };
            while node.predecessors().iter().any(|p| !settled[p.index()]) {
                let Some((done, outcome)) = pending.pop_front() else {
                    return StepEnd::Truncated;
                };
                settled[done.index()] = true;
                if !outcome.is_success() {
                    return StepEnd::Failed;
                }
            }

            if node.kind() == EffectKind::Barrier {
                settled[node.id().index()] = true;
                continue;
            }
            let Some(outcome) = oracle.outcomes.get(&node.id()) else {
                // A submitted node may still have been in flight when the log ended
                return StepEnd::Truncated;
            };
            if node.kind().needs_backend() && node.kind() != EffectKind::Checkpoint {
                if !oracle.submitted.contains(&node.id()) {
                    // Rejected before submission
                    return StepEnd::Failed;
                }
                pending.push_back((node.id(), outcome.clone()));
                continue;
            }
            if !outcome.is_success() {
                return StepEnd::Failed;
            }
            if let Some(label) = node.lifecycle_handle() {
                let label = label.to_string();
                if node.kind() == EffectKind::Alloc {
                    self.live.push(label.clone());
                    self.events.push(ProtocolEvent::Allocated { handle: label });
                } else {
                    self.live.retain(|l| *l != label);
                    self.events.push(ProtocolEvent::Freed { handle: label });
                }
            }
            settled[node.id().index()] = true;
        }

        while let Some((_, outcome)) = pending.pop_front() {
            if !outcome.is_success() {
                return StepEnd::Failed;
            }
        }
        StepEnd::Finished
    }

    fn enter_cleanup(&mut self) {
        if self.mode == ExecutionMode::Running {
            self.mode = ExecutionMode::Cleanup;
            self.events.push(ProtocolEvent::ModeChanged {
                from: ExecutionMode::Running,
                to: ExecutionMode::Cleanup,
            });
        }
    }

    fn release(&mut self) {
        for label in std::mem::take(&mut self.live) {
            self.events.push(ProtocolEvent::Freed { handle: label });
        }
    }

    fn finish(&mut self) {
        let next = if self.failed {
            ExecutionMode::Failed
        } else {
            ExecutionMode::Done
        };
        self.events.push(ProtocolEvent::ModeChanged {
            from: self.mode,
            to: next,
        });
        self.mode = next;
    }

    fn halt(&mut self, failed: bool) {
        if self.mode.is_terminal() {
            return;
        }
        self.failed |= failed;
        self.enter_cleanup();
        self.release();
        self.finish();
    }
}

/// Replay the coordinator log
///
/// Returns one report for the epoch transitions and one for checkpoint
/// decisions. Events are compared per epoch and per checkpoint, since
/// different epochs and checkpoints publish under separate locks.
pub fn replay_coordinator(log: &EffectLog) -> Vec<ReplayReport> {
    let inputs: Vec<ProtocolInput> = log.cursor().filter_map(|e| e.input().cloned()).collect();
    let recorded: Vec<ProtocolEvent> = log.cursor().filter_map(|e| e.event().cloned()).collect();

    vec![
        ReplayReport::compare(
            format!("{}/epochs", log.name()),
            &grouped(derive_epochs(&inputs).iter(), epoch_of),
            &grouped(recorded.iter(), epoch_of),
        ),
        ReplayReport::compare(
            format!("{}/checkpoints", log.name()),
            &grouped(derive_checkpoints(&inputs).iter(), checkpoint_of),
            &grouped(recorded.iter(), checkpoint_of),
        ),
    ]
}

fn derive_epochs(inputs: &[ProtocolInput]) -> Vec<ProtocolEvent> {
    let mut records: BTreeMap<Epoch, EpochRecord> = BTreeMap::new();
    let mut events = Vec::new();
    let mut emit = |epoch: Epoch, moved: Vec<EpochPhase>| {
        events.extend(
            moved
                .into_iter()
                .map(|phase| ProtocolEvent::EpochTransition { epoch, phase }),
        );
    };

    for input in inputs {
        match input {
            ProtocolInput::EpochOpened { epoch, candidates } => {
                records.insert(*epoch, EpochRecord::new(*epoch, candidates.clone()));
                emit(*epoch, vec![EpochPhase::Forming]);
            }
            ProtocolInput::Proposal {
                epoch,
                worker,
                membership,
            } => {
                if let Some(Ok(moved)) = records
                    .get_mut(epoch)
                    .map(|r| r.propose(worker, membership.clone()))
                {
                    emit(*epoch, moved);
                }
            }
            ProtocolInput::Collective {
                epoch,
                worker,
                operation,
            } => {
                if let Some(Ok((_, moved))) = records.get_mut(epoch).map(|r| r.collective(worker, operation)) {
                    emit(*epoch, moved);
                }
            }
            ProtocolInput::StepReported { epoch, worker } => {
                if let Some(Ok(moved)) = records.get_mut(epoch).map(|r| r.report_step(worker)) {
                    emit(*epoch, moved);
                }
            }
            ProtocolInput::WorkerFailed { epoch, worker } => {
                if let Some(record) = records.get_mut(epoch) {
                    emit(*epoch, record.worker_failed(worker));
                }
            }
            ProtocolInput::Timeout { epoch, phase } => {
                if let Some(record) = records.get_mut(epoch) {
                    emit(*epoch, record.timeout(*phase));
                }
            }
            _ => {}
        }
    }
    events
}

fn derive_checkpoints(inputs: &[ProtocolInput]) -> Vec<ProtocolEvent> {
    // A commit decision whose marker never landed shows up as a later input
    let unpublished: HashSet<&str> = inputs
        .iter()
        .filter_map(|input| match input {
            ProtocolInput::PublishFailed { checkpoint, .. } => Some(checkpoint.as_str()),
            _ => None,
        })
        .collect();

    let mut records: HashMap<CheckpointId, CheckpointRecord> = HashMap::new();
    let mut events = Vec::new();

    for input in inputs {
        let (id, decision) = match input {
            ProtocolInput::CheckpointBegun {
                checkpoint,
                epoch,
                shards,
            } => {
                records
                    .entry(checkpoint.clone())
                    .or_insert_with(|| CheckpointRecord::new(checkpoint.clone(), *epoch, shards.iter().copied()));
                continue;
            }
            ProtocolInput::Vote {
                checkpoint,
                shard,
                location,
            } => (
                checkpoint,
                records
                    .get_mut(checkpoint)
                    .and_then(|r| r.vote(*shard, location.clone()).ok().flatten()),
            ),
            ProtocolInput::VoteTimeout { checkpoint } => {
                (checkpoint, records.get_mut(checkpoint).and_then(|r| r.expire()))
            }
            ProtocolInput::PublishFailed { checkpoint, reason } => (
                checkpoint,
                records
                    .get_mut(checkpoint)
                    .and_then(|r| r.publish_failed(reason.clone())),
            ),
            _ => continue,
        };

        match decision {
            Some(Decision::Commit { .. }) if unpublished.contains(id.as_str()) => {}
            Some(Decision::Commit { .. }) => {
                if let Some(record) = records.get_mut(id) {
                    let _ = record.committed();
                    events.push(ProtocolEvent::CheckpointCommitted {
                        checkpoint: id.clone(),
                        epoch: record.epoch(),
                    });
                }
            }
            Some(Decision::Abort { reason }) => events.push(ProtocolEvent::CheckpointAborted {
                checkpoint: id.clone(),
                reason,
            }),
            None => {}
        }
    }
    events
}

fn epoch_of(event: &ProtocolEvent) -> Option<String> {
    match event {
        ProtocolEvent::EpochTransition { epoch, .. } => Some(format!("{:020}", epoch)),
        _ => None,
    }
}

fn checkpoint_of(event: &ProtocolEvent) -> Option<String> {
    match event {
        ProtocolEvent::CheckpointCommitted { checkpoint, .. }
        | ProtocolEvent::CheckpointAborted { checkpoint, .. } => Some(checkpoint.clone()),
        _ => None,
    }
}

/// Events selected by `key`, grouped by key in a stable order
fn grouped<'e>(
    events: impl Iterator<Item = &'e ProtocolEvent>,
    key: fn(&ProtocolEvent) -> Option<String>,
) -> Vec<ProtocolEvent> {
    let mut groups: BTreeMap<String, Vec<ProtocolEvent>> = BTreeMap::new();
    for event in events {
        if let Some(k) = key(event) {
            groups.entry(k).or_default().push(event.clone());
        }
    }
    groups.into_values().flatten().collect()
}

/// Replay every log a cohort run produced
pub fn replay_job(job: &CohortJob, report: &JobReport) -> Result<Vec<ReplayReport>> {
    let mut reports = Vec::with_capacity(report.incarnations.len() + 2);
    for incarnation in &report.incarnations {
        let rank = job
            .manifest()
            .rank_of(&incarnation.worker)
            .ok_or_else(|| Error::WorkerNotFound {
                worker_id: incarnation.worker.clone(),
            })?;
        let schedule = Scheduler::new(job.config().topology.clone(), rank).schedule(job.graph())?;
        reports.push(replay_worker(job.graph(), &schedule, &incarnation.log));
    }
    reports.extend(replay_coordinator(&report.coordinator_log));
    Ok(reports)
}

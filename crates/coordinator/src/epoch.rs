//! Per-epoch state machine
//!
//! `Forming -> Agreed -> Executing -> Closing -> Closed`, with `Aborted`
//! reachable from every non-terminal phase. The machine is pure: it takes
//! inputs and returns the phases it moved through, so the coordinator and
//! the replay interpreter drive exactly the same code.

use std::collections::{BTreeMap, BTreeSet};

use runtime_core::{Epoch, EpochPhase, Error, Result, WorkerId};

use crate::collective::{CollectiveGroup, CollectiveSequencer};

/// State of one epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    epoch: Epoch,
    phase: EpochPhase,
    candidates: Vec<WorkerId>,
    proposals: BTreeMap<WorkerId, Vec<WorkerId>>,
    group: Option<CollectiveGroup>,
    collectives: CollectiveSequencer,
    reported: BTreeSet<WorkerId>,
    abort_reason: Option<String>,
}

impl EpochRecord {
    pub fn new(epoch: Epoch, candidates: Vec<WorkerId>) -> Self {
        Self {
            epoch,
            phase: EpochPhase::Forming,
            candidates,
            proposals: BTreeMap::new(),
            group: None,
            collectives: CollectiveSequencer::default(),
            reported: BTreeSet::new(),
            abort_reason: None,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    pub fn candidates(&self) -> &[WorkerId] {
        &self.candidates
    }

    pub fn group(&self) -> Option<&CollectiveGroup> {
        self.group.as_ref()
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Whether `worker` takes part in this epoch
    pub fn involves(&self, worker: &str) -> bool {
        match &self.group {
            Some(group) => group.contains(worker),
            None => self.candidates.iter().any(|c| c == worker),
        }
    }

    fn move_to(&mut self, next: EpochPhase, moved: &mut Vec<EpochPhase>) -> Result<()> {
        let allowed = matches!(
            (self.phase, next),
            (EpochPhase::Forming, EpochPhase::Agreed)
                | (EpochPhase::Agreed, EpochPhase::Executing)
                | (EpochPhase::Executing, EpochPhase::Closing)
                | (EpochPhase::Closing, EpochPhase::Closed)
        ) || (!self.phase.is_terminal() && next == EpochPhase::Aborted);

        if !allowed {
            return Err(Error::InvalidEpochTransition {
                epoch: self.epoch,
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        moved.push(next);
        Ok(())
    }

    fn ensure_not_aborted(&self) -> Result<()> {
        if self.phase == EpochPhase::Aborted {
            return Err(Error::EpochAborted {
                epoch: self.epoch,
                reason: self.abort_reason.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Record a membership proposal
    ///
    /// Agreement needs an identical proposal from every candidate. A
    /// differing proposal is rejected and the epoch stays `Forming`.
    pub fn propose(&mut self, worker: &str, membership: Vec<WorkerId>) -> Result<Vec<EpochPhase>> {
        self.ensure_not_aborted()?;
        if !self.candidates.iter().any(|c| c == worker) {
            return Err(Error::NotAMember {
                epoch: self.epoch,
                worker_id: worker.to_string(),
            });
        }

        if let Some(previous) = self.proposals.get(worker) {
            if *previous == membership {
                // Duplicate delivery
                return Ok(Vec::new());
            }
            return Err(Error::assumption(
                "network.duplicate-consistent",
                format!(
                    "{} sent two different proposals for epoch {}",
                    worker, self.epoch
                ),
            ));
        }

        if self.phase != EpochPhase::Forming {
            return Err(Error::InvalidEpochTransition {
                epoch: self.epoch,
                from: self.phase,
                to: EpochPhase::Agreed,
            });
        }

        if let Some(unknown) = membership
            .iter()
            .find(|m| !self.candidates.iter().any(|c| c == *m))
        {
            return Err(Error::NotAMember {
                epoch: self.epoch,
                worker_id: unknown.clone(),
            });
        }

        if let Some((other, theirs)) = self.proposals.iter().find(|(_, p)| **p != membership) {
            return Err(Error::assumption(
                "membership.identical-proposals",
                format!(
                    "epoch {}: {} proposed [{}] but {} proposed [{}]",
                    self.epoch,
                    other,
                    theirs.join(", "),
                    worker,
                    membership.join(", ")
                ),
            ));
        }

        self.proposals.insert(worker.to_string(), membership.clone());
        let mut moved = Vec::new();
        if self.proposals.len() == self.candidates.len() {
            self.group = Some(CollectiveGroup::new(self.epoch, membership));
            self.move_to(EpochPhase::Agreed, &mut moved)?;
        }
        Ok(moved)
    }

    fn ensure_member(&self, worker: &str) -> Result<()> {
        let member = self.group.as_ref().is_some_and(|g| g.contains(worker));
        if !member {
            return Err(Error::NotAMember {
                epoch: self.epoch,
                worker_id: worker.to_string(),
            });
        }
        Ok(())
    }

    fn start_if_agreed(&mut self, moved: &mut Vec<EpochPhase>) -> Result<()> {
        if self.phase == EpochPhase::Agreed {
            self.move_to(EpochPhase::Executing, moved)?;
        }
        Ok(())
    }

    /// Register the next collective `worker` is about to issue
    pub fn collective(&mut self, worker: &str, operation: &str) -> Result<(u64, Vec<EpochPhase>)> {
        self.ensure_not_aborted()?;
        self.ensure_member(worker)?;
        if !matches!(
            self.phase,
            EpochPhase::Agreed | EpochPhase::Executing | EpochPhase::Closing
        ) {
            return Err(Error::InvalidEpochTransition {
                epoch: self.epoch,
                from: self.phase,
                to: EpochPhase::Executing,
            });
        }
        if self.reported.contains(worker) {
            return Err(Error::assumption(
                "collective.identical-order",
                format!(
                    "{} issued '{}' after reporting epoch {} complete",
                    worker, operation, self.epoch
                ),
            ));
        }

        let position = self.collectives.register(worker, operation)?;
        let mut moved = Vec::new();
        self.start_if_agreed(&mut moved)?;
        Ok((position, moved))
    }

    /// Record that `worker` finished its step
    pub fn report_step(&mut self, worker: &str) -> Result<Vec<EpochPhase>> {
        self.ensure_not_aborted()?;
        self.ensure_member(worker)?;

        let mut moved = Vec::new();
        if !self.reported.insert(worker.to_string()) {
            return Ok(moved);
        }
        self.start_if_agreed(&mut moved)?;
        if self.phase == EpochPhase::Executing {
            self.move_to(EpochPhase::Closing, &mut moved)?;
        }

        let all = self
            .group
            .as_ref()
            .is_some_and(|g| g.members().iter().all(|m| self.reported.contains(m)));
        if all {
            self.move_to(EpochPhase::Closed, &mut moved)?;
        }
        Ok(moved)
    }

    /// Abort unless already terminal
    pub fn abort(&mut self, reason: impl Into<String>) -> Vec<EpochPhase> {
        let mut moved = Vec::new();
        if self.phase.is_terminal() {
            return moved;
        }
        self.abort_reason = Some(reason.into());
        // Aborted is reachable from every non-terminal phase
        let _ = self.move_to(EpochPhase::Aborted, &mut moved);
        moved
    }

    /// A barrier timed out while the epoch was in `phase`
    pub fn timeout(&mut self, phase: EpochPhase) -> Vec<EpochPhase> {
        if self.phase != phase {
            return Vec::new();
        }
        self.abort(format!("timed out in {}", phase))
    }

    /// `worker` was declared failed
    pub fn worker_failed(&mut self, worker: &str) -> Vec<EpochPhase> {
        if !self.involves(worker) {
            return Vec::new();
        }
        self.abort(format!("worker {} failed", worker))
    }
}

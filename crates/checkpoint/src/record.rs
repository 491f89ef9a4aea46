//! Per-checkpoint commit state machine
//!
//! `Preparing -> Voted -> Committed`, or `Aborted` from any non-terminal
//! status. The record only decides; publishing the marker and collecting
//! garbage is left to the caller, which reports back with
//! [`CheckpointRecord::committed`] or [`CheckpointRecord::publish_failed`].

use std::collections::{BTreeMap, BTreeSet};

use runtime_core::{CheckpointId, CheckpointStatus, Epoch, Error, Result, ShardId};
use serde::{Deserialize, Serialize};

/// What the caller must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Every shard voted yes: publish a marker with these locations
    Commit { locations: BTreeMap<ShardId, String> },

    /// Collect every staged shard
    Abort { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    id: CheckpointId,
    epoch: Epoch,
    shards: BTreeSet<ShardId>,
    votes: BTreeMap<ShardId, Option<String>>,
    status: CheckpointStatus,
    decided: bool,
    abort_reason: Option<String>,
}

impl CheckpointRecord {
    pub fn new(id: impl Into<CheckpointId>, epoch: Epoch, shards: impl IntoIterator<Item = ShardId>) -> Self {
        Self {
            id: id.into(),
            epoch,
            shards: shards.into_iter().collect(),
            votes: BTreeMap::new(),
            status: CheckpointStatus::Preparing,
            decided: false,
            abort_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn shards(&self) -> &BTreeSet<ShardId> {
        &self.shards
    }

    pub fn status(&self) -> CheckpointStatus {
        self.status
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Shards that have not voted yet
    pub fn missing(&self) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|s| !self.votes.contains_key(s))
            .copied()
            .collect()
    }

    /// Locations reported by successful votes
    pub fn locations(&self) -> BTreeMap<ShardId, String> {
        self.votes
            .iter()
            .filter_map(|(shard, location)| location.clone().map(|l| (*shard, l)))
            .collect()
    }

    /// Record the vote of `shard`; `None` means its write failed
    ///
    /// Repeating a vote is a no-op. Votes arriving after the decision are
    /// accepted and ignored so late writers can learn the outcome.
    pub fn vote(&mut self, shard: ShardId, location: Option<String>) -> Result<Option<Decision>> {
        if !self.shards.contains(&shard) {
            return Err(Error::CheckpointVoteFailed {
                checkpoint_id: self.id.clone(),
                shard,
                reason: "shard is not part of this checkpoint".to_string(),
            });
        }

        if let Some(previous) = self.votes.get(&shard) {
            if *previous == location {
                return Ok(None);
            }
            return Err(Error::assumption(
                "network.duplicate-consistent",
                format!(
                    "shard {} of {} voted {:?} then {:?}",
                    shard, self.id, previous, location
                ),
            ));
        }

        if self.decided || self.status.is_terminal() {
            return Ok(None);
        }

        let failed = location.is_none();
        self.votes.insert(shard, location);
        self.status = CheckpointStatus::Voted;

        if failed {
            return Ok(self.abort(format!("shard {} write failed", shard)));
        }
        if self.missing().is_empty() {
            self.decided = true;
            return Ok(Some(Decision::Commit {
                locations: self.locations(),
            }));
        }
        Ok(None)
    }

    /// Abort unless already decided
    pub fn abort(&mut self, reason: impl Into<String>) -> Option<Decision> {
        if self.decided || self.status.is_terminal() {
            return None;
        }
        let reason = reason.into();
        self.decided = true;
        self.status = CheckpointStatus::Aborted;
        self.abort_reason = Some(reason.clone());
        Some(Decision::Abort { reason })
    }

    /// The vote barrier timed out
    pub fn expire(&mut self) -> Option<Decision> {
        let missing = self.missing();
        self.abort(format!("vote timeout, missing shards {:?}", missing))
    }

    /// The marker is durable
    pub fn committed(&mut self) -> Result<()> {
        if !self.decided || self.status != CheckpointStatus::Voted || !self.missing().is_empty() {
            return Err(Error::Internal {
                message: format!("{} cannot commit from {}", self.id, self.status),
            });
        }
        self.status = CheckpointStatus::Committed;
        Ok(())
    }

    /// Publishing the marker failed after a commit decision
    pub fn publish_failed(&mut self, reason: impl Into<String>) -> Option<Decision> {
        if self.status != CheckpointStatus::Voted {
            return None;
        }
        let reason = reason.into();
        self.status = CheckpointStatus::Aborted;
        self.abort_reason = Some(reason.clone());
        Some(Decision::Abort { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CheckpointRecord {
        CheckpointRecord::new("ckpt-1", 3, 0..3)
    }

    #[test]
    fn test_all_votes_commit() {
        let mut rec = record();
        assert_eq!(rec.status(), CheckpointStatus::Preparing);
        assert_eq!(rec.vote(0, Some("a".into())).unwrap(), None);
        assert_eq!(rec.status(), CheckpointStatus::Voted);
        assert_eq!(rec.vote(2, Some("c".into())).unwrap(), None);

        let decision = rec.vote(1, Some("b".into())).unwrap();
        let Some(Decision::Commit { locations }) = decision else {
            panic!("expected commit, got {:?}", decision);
        };
        assert_eq!(locations.len(), 3);
        // Not visible until the marker is durable
        assert_eq!(rec.status(), CheckpointStatus::Voted);
        rec.committed().unwrap();
        assert_eq!(rec.status(), CheckpointStatus::Committed);
    }

    #[test]
    fn test_failed_vote_aborts() {
        let mut rec = record();
        rec.vote(0, Some("a".into())).unwrap();
        let decision = rec.vote(1, None).unwrap();
        assert!(matches!(decision, Some(Decision::Abort { .. })));
        assert_eq!(rec.status(), CheckpointStatus::Aborted);

        // A late success changes nothing
        assert_eq!(rec.vote(2, Some("c".into())).unwrap(), None);
        assert_eq!(rec.status(), CheckpointStatus::Aborted);
        assert!(rec.committed().is_err());
    }

    #[test]
    fn test_duplicate_votes() {
        let mut rec = record();
        rec.vote(0, Some("a".into())).unwrap();
        assert_eq!(rec.vote(0, Some("a".into())).unwrap(), None);

        let err = rec.vote(0, Some("elsewhere".into())).unwrap_err();
        assert!(matches!(
            err,
            Error::AssumptionViolation { ref assumption, .. } if assumption == "network.duplicate-consistent"
        ));
    }

    #[test]
    fn test_unknown_shard_rejected() {
        let mut rec = record();
        assert!(matches!(
            rec.vote(7, Some("x".into())),
            Err(Error::CheckpointVoteFailed { shard: 7, .. })
        ));
    }

    #[test]
    fn test_expire_names_missing_shards() {
        let mut rec = record();
        rec.vote(0, Some("a".into())).unwrap();
        rec.vote(1, Some("b".into())).unwrap();
        let Some(Decision::Abort { reason }) = rec.expire() else {
            panic!("expected abort");
        };
        assert!(reason.contains("[2]"));
        assert_eq!(rec.expire(), None);
    }

    #[test]
    fn test_expire_after_commit_decision_is_ignored() {
        let mut rec = CheckpointRecord::new("ckpt-2", 1, [0]);
        assert!(matches!(
            rec.vote(0, Some("a".into())).unwrap(),
            Some(Decision::Commit { .. })
        ));
        assert_eq!(rec.expire(), None);
        assert!(matches!(
            rec.publish_failed("marker exists"),
            Some(Decision::Abort { .. })
        ));
        assert_eq!(rec.status(), CheckpointStatus::Aborted);
    }
}

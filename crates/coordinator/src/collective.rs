//! Collective groups and cross-worker collective ordering

use std::collections::BTreeMap;

use runtime_core::{Epoch, Error, Result, WorkerId};
use serde::{Deserialize, Serialize};

/// Ordered participants of the collectives in one epoch
///
/// The order is fixed when the epoch reaches `Agreed` and every worker sees
/// the same list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveGroup {
    epoch: Epoch,
    members: Vec<WorkerId>,
}

impl CollectiveGroup {
    pub fn new(epoch: Epoch, members: Vec<WorkerId>) -> Self {
        Self { epoch, members }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn members(&self) -> &[WorkerId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, worker: &str) -> bool {
        self.members.iter().any(|m| m == worker)
    }

    /// Position of `worker` inside the group
    pub fn rank_of(&self, worker: &str) -> Option<usize> {
        self.members.iter().position(|m| m == worker)
    }
}

/// Checks that every worker issues the same collectives in the same order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectiveSequencer {
    /// position -> (operation, first worker to register it)
    slots: BTreeMap<u64, (String, WorkerId)>,
    next: BTreeMap<WorkerId, u64>,
}

impl CollectiveSequencer {
    /// Register `worker`'s next collective and return its position
    pub fn register(&mut self, worker: &str, operation: &str) -> Result<u64> {
        let position = self.next.get(worker).copied().unwrap_or(0);

        match self.slots.get(&position) {
            Some((expected, first)) if expected != operation => {
                return Err(Error::assumption(
                    "collective.identical-order",
                    format!(
                        "collective #{} is '{}' on {} but '{}' on {}",
                        position, expected, first, operation, worker
                    ),
                ));
            }
            Some(_) => {}
            None => {
                self.slots
                    .insert(position, (operation.to_string(), worker.to_string()));
            }
        }

        self.next.insert(worker.to_string(), position + 1);
        Ok(position)
    }

    /// Collectives issued so far by `worker`
    pub fn issued_by(&self, worker: &str) -> u64 {
        self.next.get(worker).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_ranks() {
        let group = CollectiveGroup::new(3, vec!["w0".into(), "w1".into(), "w2".into()]);
        assert_eq!(group.rank_of("w2"), Some(2));
        assert_eq!(group.rank_of("w9"), None);
        assert!(group.contains("w1"));
        assert_eq!(group.len(), 3);
    }

    #[test]
    fn test_identical_order_accepted() {
        let mut seq = CollectiveSequencer::default();
        assert_eq!(seq.register("w0", "reduce_grads").unwrap(), 0);
        assert_eq!(seq.register("w0", "broadcast").unwrap(), 1);
        assert_eq!(seq.register("w1", "reduce_grads").unwrap(), 0);
        assert_eq!(seq.register("w1", "broadcast").unwrap(), 1);
        assert_eq!(seq.issued_by("w1"), 2);
    }

    #[test]
    fn test_reordered_collectives_rejected() {
        let mut seq = CollectiveSequencer::default();
        seq.register("w0", "reduce_grads").unwrap();
        seq.register("w0", "broadcast").unwrap();

        let err = seq.register("w1", "broadcast").unwrap_err();
        assert!(matches!(
            err,
            Error::AssumptionViolation { ref assumption, .. } if assumption == "collective.identical-order"
        ));
    }
}

//! Pinned run manifest
//!
//! The manifest is read once at startup and never changes for the life of
//! a run. It pins the backend release the run was validated against, the
//! worker ordering used for collective groups, the seed derivation rule and
//! the dataset partition mapping.

use crate::types::{Epoch, WorkerId};
use crate::{Error, Result};
use fnv::FnvHasher;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Identifier of an execution backend build. Documented backend assumptions
/// are versioned against this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendRelease {
    pub name: String,
    pub version: String,
}

impl BackendRelease {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for BackendRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Rule used to derive every random seed in the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRule {
    pub base_seed: u64,
}

/// How a dataset is split across workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetPartition {
    pub dataset_id: String,

    /// Number of partitions the dataset is cut into
    pub partitions: u64,

    /// Reshuffle partition order every epoch
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_shuffle() -> bool {
    true
}

/// Persisted configuration for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Run identifier
    pub run_id: String,

    /// Backend release the run was validated against
    pub backend: BackendRelease,

    /// Worker identities in their fixed collective order
    pub workers: Vec<WorkerId>,

    /// Seed derivation rule
    pub seed: SeedRule,

    /// Dataset partition mapping
    #[serde(default)]
    pub datasets: Vec<DatasetPartition>,
}

impl RunManifest {
    /// Create a manifest with no datasets
    pub fn new(
        run_id: impl Into<String>,
        backend: BackendRelease,
        workers: Vec<WorkerId>,
        base_seed: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            backend,
            workers,
            seed: SeedRule { base_seed },
            datasets: Vec::new(),
        }
    }

    /// Load and validate a JSON manifest
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let manifest: RunManifest = serde_json::from_str(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject manifests that cannot describe a run
    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(Error::InvalidConfig {
                message: "manifest lists no workers".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker) {
                return Err(Error::InvalidConfig {
                    message: format!("worker '{}' listed twice in manifest", worker),
                });
            }
        }

        for dataset in &self.datasets {
            if dataset.partitions == 0 {
                return Err(Error::InvalidConfig {
                    message: format!("dataset '{}' has no partitions", dataset.dataset_id),
                });
            }
        }

        Ok(())
    }

    /// Refuse to run against a backend other than the pinned release
    pub fn check_backend(&self, actual: &BackendRelease) -> Result<()> {
        if &self.backend != actual {
            return Err(Error::ManifestMismatch {
                field: "backend".to_string(),
                expected: self.backend.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Position of a worker in the fixed ordering
    pub fn rank_of(&self, worker_id: &str) -> Option<u32> {
        self.workers
            .iter()
            .position(|w| w == worker_id)
            .map(|pos| pos as u32)
    }

    pub fn world_size(&self) -> u32 {
        self.workers.len() as u32
    }

    /// Stable digest of the whole manifest
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        self.run_id.hash(&mut hasher);
        self.backend.hash(&mut hasher);
        self.workers.hash(&mut hasher);
        self.seed.base_seed.hash(&mut hasher);
        for dataset in &self.datasets {
            dataset.dataset_id.hash(&mut hasher);
            dataset.partitions.hash(&mut hasher);
            dataset.shuffle.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Seed for a worker rank in an epoch
    pub fn derive_seed(&self, epoch: Epoch, rank: u32) -> u64 {
        let mut hasher = FnvHasher::default();
        self.seed.base_seed.hash(&mut hasher);
        epoch.hash(&mut hasher);
        rank.hash(&mut hasher);
        ChaCha8Rng::seed_from_u64(hasher.finish()).next_u64()
    }

    /// Partitions of `dataset_id` assigned to `rank` in `epoch`.
    ///
    /// The per-epoch order is a seeded shuffle; partitions are dealt round
    /// robin over the fixed worker ordering.
    pub fn partitions_for(&self, dataset_id: &str, epoch: Epoch, rank: u32) -> Result<Vec<u64>> {
        let dataset = self
            .datasets
            .iter()
            .find(|d| d.dataset_id == dataset_id)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("dataset '{}' not in manifest", dataset_id),
            })?;

        let world = self.world_size();
        if rank >= world {
            return Err(Error::InvalidConfig {
                message: format!("rank {} outside world size {}", rank, world),
            });
        }

        let mut order: Vec<u64> = (0..dataset.partitions).collect();
        if dataset.shuffle {
            let mut hasher = FnvHasher::default();
            self.seed.base_seed.hash(&mut hasher);
            dataset_id.hash(&mut hasher);
            epoch.hash(&mut hasher);
            let mut rng = ChaCha8Rng::seed_from_u64(hasher.finish());
            order.shuffle(&mut rng);
        }

        Ok(order
            .into_iter()
            .enumerate()
            .filter_map(|(idx, partition)| {
                if (idx as u32) % world == rank {
                    Some(partition)
                } else {
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> RunManifest {
        let mut manifest = RunManifest::new(
            "run-1",
            BackendRelease::new("sim", "1.0.0"),
            vec!["w0".to_string(), "w1".to_string(), "w2".to_string()],
            42,
        );
        manifest.datasets.push(DatasetPartition {
            dataset_id: "tokens".to_string(),
            partitions: 30,
            shuffle: true,
        });
        manifest
    }

    #[test]
    fn test_validate_duplicate_worker() {
        let mut m = manifest();
        m.workers.push("w0".to_string());
        assert!(matches!(m.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_backend_pinning() {
        let m = manifest();
        assert!(m.check_backend(&BackendRelease::new("sim", "1.0.0")).is_ok());
        let err = m
            .check_backend(&BackendRelease::new("sim", "1.1.0"))
            .unwrap_err();
        assert!(matches!(err, Error::ManifestMismatch { .. }));
    }

    #[test]
    fn test_seed_derivation_is_stable() {
        let a = manifest();
        let b = manifest();
        assert_eq!(a.derive_seed(3, 1), b.derive_seed(3, 1));
        assert_ne!(a.derive_seed(3, 1), a.derive_seed(4, 1));
        assert_ne!(a.derive_seed(3, 1), a.derive_seed(3, 2));
    }

    #[test]
    fn test_partitions_cover_dataset() {
        let m = manifest();
        let mut all = Vec::new();
        for rank in 0..3 {
            let parts = m.partitions_for("tokens", 0, rank).unwrap();
            assert_eq!(parts.len(), 10);
            all.extend(parts);
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 30);
    }

    #[test]
    fn test_partitions_reshuffle_per_epoch() {
        let m = manifest();
        let epoch0 = m.partitions_for("tokens", 0, 0).unwrap();
        let epoch1 = m.partitions_for("tokens", 1, 0).unwrap();
        assert_ne!(epoch0, epoch1);
        assert_eq!(epoch0, m.partitions_for("tokens", 0, 0).unwrap());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = manifest();
        let mut b = manifest();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.workers.swap(0, 1);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}

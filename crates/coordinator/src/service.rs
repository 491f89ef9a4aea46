//! Cohort coordinator
//!
//! Drives one [`EpochRecord`] per epoch, exposes the agreement and close
//! barriers as async waits with timeouts, and watches worker liveness.
//! Every input is appended to the coordinator's effect log under the
//! epoch's lock before it is applied, so log order is apply order. Phase
//! changes are appended after.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use effect_log::{EffectLog, ProtocolEvent, ProtocolInput};
use parking_lot::Mutex;
use runtime_core::config::CoordinatorConfig;
use runtime_core::{
    Epoch, EpochPhase, Error, Result, RunManifest, WorkerId, WorkerRegistryHandle, WorkerState,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::collective::CollectiveGroup;
use crate::epoch::EpochRecord;

struct EpochSlot {
    attempt: u32,
    candidates: Vec<WorkerId>,
    record: Mutex<EpochRecord>,
    phase_tx: watch::Sender<EpochPhase>,
}

#[derive(Debug, Default)]
struct Progress {
    last_closed: Option<Epoch>,
    current: Option<Epoch>,
}

/// Coordinator for one run
pub struct Coordinator {
    workers: Vec<WorkerId>,
    first_epoch: Epoch,
    config: CoordinatorConfig,
    registry: WorkerRegistryHandle,
    log: EffectLog,
    epochs: DashMap<Epoch, Arc<EpochSlot>>,
    progress: Mutex<Progress>,
}

pub type CoordinatorHandle = Arc<Coordinator>;

impl Coordinator {
    pub fn new(
        manifest: &RunManifest,
        config: CoordinatorConfig,
        registry: WorkerRegistryHandle,
        log: EffectLog,
    ) -> Self {
        Self {
            workers: manifest.workers.clone(),
            first_epoch: 1,
            config,
            registry,
            log,
            epochs: DashMap::new(),
            progress: Mutex::new(Progress::default()),
        }
    }

    /// Resume numbering after `epoch`, e.g. when restarting from a checkpoint
    pub fn resume_after(self, epoch: Epoch) -> Self {
        *self.progress.lock() = Progress {
            last_closed: Some(epoch),
            current: None,
        };
        self
    }

    pub fn log(&self) -> &EffectLog {
        &self.log
    }

    pub fn registry(&self) -> &WorkerRegistryHandle {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Register a manifest worker with the liveness registry
    pub fn register_worker(&self, worker_id: &str) -> Result<()> {
        let rank = self
            .workers
            .iter()
            .position(|w| w == worker_id)
            .ok_or_else(|| Error::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })?;
        self.registry.register(worker_id, rank as u32)?;
        self.registry.set_state(worker_id, WorkerState::Active)?;
        Ok(())
    }

    pub fn heartbeat(&self, worker_id: &str, epoch: Epoch) -> Result<()> {
        self.registry
            .heartbeat(worker_id, WorkerState::Active, epoch)
    }

    pub fn last_closed(&self) -> Option<Epoch> {
        self.progress.lock().last_closed
    }

    /// Epoch that must be opened next
    pub fn next_epoch(&self) -> Epoch {
        self.progress
            .lock()
            .last_closed
            .map_or(self.first_epoch, |e| e + 1)
    }

    pub fn phase(&self, epoch: Epoch) -> Option<EpochPhase> {
        self.find(epoch).map(|slot| slot.record.lock().phase())
    }

    pub fn group(&self, epoch: Epoch) -> Option<CollectiveGroup> {
        self.find(epoch)
            .and_then(|slot| slot.record.lock().group().cloned())
    }

    /// How many times `epoch` has been opened
    pub fn attempt(&self, epoch: Epoch) -> Option<u32> {
        self.find(epoch).map(|slot| slot.attempt)
    }

    /// Clone the slot out of the map so no shard lock is held afterwards
    fn find(&self, epoch: Epoch) -> Option<Arc<EpochSlot>> {
        self.epochs.get(&epoch).map(|slot| Arc::clone(slot.value()))
    }

    fn slot(&self, epoch: Epoch) -> Result<Arc<EpochSlot>> {
        self.find(epoch).ok_or_else(|| Error::EpochOutOfOrder {
            epoch,
            expected: self.next_epoch(),
        })
    }

    /// Log and publish phase changes; advance the counter on close
    fn publish(&self, slot: &EpochSlot, epoch: Epoch, moved: &[EpochPhase]) {
        for phase in moved {
            self.log
                .event(None, ProtocolEvent::EpochTransition { epoch, phase: *phase });
            info!(epoch, phase = %phase, "Epoch transition");
        }
        if let Some(last) = moved.last() {
            if *last == EpochPhase::Closed {
                let mut progress = self.progress.lock();
                progress.last_closed = Some(epoch);
                progress.current = None;
            }
            let _ = slot.phase_tx.send(*last);
        }
    }

    /// Open `epoch`, or return its candidates if it is already open
    ///
    /// Candidates are the manifest workers that are currently live, in
    /// manifest order. An aborted epoch may be opened again.
    #[instrument(skip(self))]
    pub fn open_epoch(&self, epoch: Epoch) -> Result<Vec<WorkerId>> {
        let mut progress = self.progress.lock();
        let expected = progress.last_closed.map_or(self.first_epoch, |e| e + 1);

        if let Some(slot) = self.find(epoch) {
            if !slot.phase_tx.borrow().is_terminal() {
                return Ok(slot.candidates.clone());
            }
        }
        if epoch != expected {
            return Err(Error::EpochOutOfOrder { epoch, expected });
        }
        if let Some(current) = progress.current.filter(|c| *c != epoch) {
            return Err(Error::EpochOutOfOrder {
                epoch,
                expected: current,
            });
        }

        let candidates: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|w| self.registry.is_live(w))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(Error::EpochAborted {
                epoch,
                reason: "no live workers".to_string(),
            });
        }

        self.log.input(ProtocolInput::EpochOpened {
            epoch,
            candidates: candidates.clone(),
        });
        let attempt = self.find(epoch).map_or(1, |slot| slot.attempt + 1);
        let (phase_tx, _) = watch::channel(EpochPhase::Forming);
        self.epochs.insert(
            epoch,
            Arc::new(EpochSlot {
                attempt,
                candidates: candidates.clone(),
                record: Mutex::new(EpochRecord::new(epoch, candidates.clone())),
                phase_tx,
            }),
        );
        progress.current = Some(epoch);
        self.log.event(
            None,
            ProtocolEvent::EpochTransition {
                epoch,
                phase: EpochPhase::Forming,
            },
        );
        info!(epoch, attempt, candidates = candidates.len(), "Epoch opened");
        Ok(candidates)
    }

    /// Submit `worker`'s membership proposal
    #[instrument(skip(self, membership))]
    pub fn propose(&self, epoch: Epoch, worker: &str, membership: Vec<WorkerId>) -> Result<EpochPhase> {
        let slot = self.slot(epoch)?;
        let mut record = slot.record.lock();
        self.log.input(ProtocolInput::Proposal {
            epoch,
            worker: worker.to_string(),
            membership: membership.clone(),
        });
        match record.propose(worker, membership) {
            Ok(moved) => {
                self.publish(&slot, epoch, &moved);
                Ok(record.phase())
            }
            Err(err) => {
                if matches!(err, Error::AssumptionViolation { .. }) {
                    error!(epoch, worker_id = %worker, code = %err.code(), error = %err, "Membership disagreement");
                }
                Err(err)
            }
        }
    }

    async fn wait_for(
        &self,
        epoch: Epoch,
        timeout: Duration,
        done: impl Fn(EpochPhase) -> bool,
    ) -> Result<EpochPhase> {
        let slot = self.slot(epoch)?;
        let mut rx = slot.phase_tx.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            loop {
                let phase = *rx.borrow_and_update();
                if done(phase) || phase == EpochPhase::Aborted {
                    return phase;
                }
                if rx.changed().await.is_err() {
                    return phase;
                }
            }
        })
        .await;

        let phase = match waited {
            Ok(phase) => phase,
            Err(_) => {
                let current = slot.record.lock().phase();
                if done(current) {
                    current
                } else {
                    self.timeout(epoch, current);
                    return Err(Error::EpochTimeout {
                        epoch,
                        phase: current,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        };

        if phase == EpochPhase::Aborted {
            let reason = slot
                .record
                .lock()
                .abort_reason()
                .unwrap_or_default()
                .to_string();
            return Err(Error::EpochAborted { epoch, reason });
        }
        Ok(phase)
    }

    /// Wait until every candidate has proposed the same membership
    pub async fn await_agreement(&self, epoch: Epoch) -> Result<CollectiveGroup> {
        self.wait_for(epoch, self.config.agreement_timeout, |phase| {
            phase != EpochPhase::Forming
        })
        .await?;
        self.group(epoch).ok_or_else(|| Error::Internal {
            message: format!("epoch {} agreed without a group", epoch),
        })
    }

    /// Check `worker`'s next collective against the other workers
    pub fn check_collective(&self, epoch: Epoch, worker: &str, operation: &str) -> Result<u64> {
        let slot = self.slot(epoch)?;
        let mut record = slot.record.lock();
        self.log.input(ProtocolInput::Collective {
            epoch,
            worker: worker.to_string(),
            operation: operation.to_string(),
        });
        let (position, moved) = record.collective(worker, operation)?;
        self.publish(&slot, epoch, &moved);
        debug!(epoch, worker_id = %worker, operation, position, "Collective ordered");
        Ok(position)
    }

    /// Record that `worker` finished its step in `epoch`
    #[instrument(skip(self))]
    pub fn report_step(&self, epoch: Epoch, worker: &str) -> Result<EpochPhase> {
        let slot = self.slot(epoch)?;
        let mut record = slot.record.lock();
        self.log.input(ProtocolInput::StepReported {
            epoch,
            worker: worker.to_string(),
        });
        let moved = record.report_step(worker)?;
        self.publish(&slot, epoch, &moved);
        Ok(record.phase())
    }

    /// Wait until every member has reported its step
    pub async fn await_closed(&self, epoch: Epoch) -> Result<()> {
        self.wait_for(epoch, self.config.close_timeout, |phase| {
            phase == EpochPhase::Closed
        })
        .await
        .map(|_| ())
    }

    /// A barrier on `epoch` timed out while in `phase`
    pub fn timeout(&self, epoch: Epoch, phase: EpochPhase) {
        let Some(slot) = self.find(epoch) else {
            return;
        };
        let mut record = slot.record.lock();
        self.log.input(ProtocolInput::Timeout { epoch, phase });
        let moved = record.timeout(phase);
        if !moved.is_empty() {
            warn!(epoch, phase = %phase, "Epoch barrier timed out");
        }
        self.publish(&slot, epoch, &moved);
    }

    /// Abort every non-terminal epoch `worker` takes part in
    #[instrument(skip(self))]
    pub fn worker_failed(&self, worker: &str) {
        if self.registry.is_live(worker) {
            let _ = self.registry.set_state(worker, WorkerState::Failed);
        }

        let mut epochs: Vec<Epoch> = self.epochs.iter().map(|e| *e.key()).collect();
        epochs.sort_unstable();
        for epoch in epochs {
            let Some(slot) = self.find(epoch) else {
                continue;
            };
            let mut record = slot.record.lock();
            if record.phase().is_terminal() || !record.involves(worker) {
                continue;
            }
            self.log.input(ProtocolInput::WorkerFailed {
                epoch,
                worker: worker.to_string(),
            });
            let moved = record.worker_failed(worker);
            self.publish(&slot, epoch, &moved);
            warn!(epoch, worker_id = %worker, "Epoch aborted after worker failure");
        }
    }

    /// Declare workers with stale heartbeats dead
    pub fn check_liveness(&self) -> Vec<WorkerId> {
        let dead = self.registry.check_dead_workers();
        for worker in &dead {
            self.worker_failed(worker);
        }
        dead
    }

    /// Run [`Coordinator::check_liveness`] periodically until shutdown
    pub fn spawn_liveness_monitor(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = coordinator.config.liveness_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dead = coordinator.check_liveness();
                        if !dead.is_empty() {
                            warn!(dead = ?dead, "Workers missed heartbeats");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Liveness monitor stopping");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = self.progress.lock();
        f.debug_struct("Coordinator")
            .field("workers", &self.workers)
            .field("last_closed", &progress.last_closed)
            .field("current", &progress.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::{BackendRelease, WorkerRegistry};

    fn workers(n: usize) -> Vec<WorkerId> {
        (0..n).map(|i| format!("w{}", i)).collect()
    }

    fn build(n: usize, config: CoordinatorConfig) -> Coordinator {
        let manifest = RunManifest::new("run", BackendRelease::new("sim", "1"), workers(n), 1);
        let registry = Arc::new(WorkerRegistry::new(config.heartbeat_timeout));
        let coordinator =
            Coordinator::new(&manifest, config, registry, EffectLog::new("coordinator"));
        for w in workers(n) {
            coordinator.register_worker(&w).unwrap();
        }
        coordinator
    }

    fn coordinator(n: usize, config: CoordinatorConfig) -> Arc<Coordinator> {
        Arc::new(build(n, config))
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            agreement_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(200),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_epoch_lifecycle() {
        let coord = coordinator(2, fast_config());
        assert_eq!(coord.next_epoch(), 1);
        assert_eq!(coord.open_epoch(1).unwrap(), workers(2));
        assert_eq!(coord.open_epoch(1).unwrap(), workers(2));

        coord.propose(1, "w0", workers(2)).unwrap();
        assert_eq!(coord.propose(1, "w1", workers(2)).unwrap(), EpochPhase::Agreed);
        let group = coord.await_agreement(1).await.unwrap();
        assert_eq!(group.members(), workers(2).as_slice());

        coord.report_step(1, "w0").unwrap();
        coord.report_step(1, "w1").unwrap();
        coord.await_closed(1).await.unwrap();
        assert_eq!(coord.last_closed(), Some(1));
        assert_eq!(coord.next_epoch(), 2);
    }

    #[tokio::test]
    async fn test_epochs_open_in_order() {
        let coord = coordinator(1, fast_config());
        assert!(matches!(
            coord.open_epoch(2),
            Err(Error::EpochOutOfOrder { expected: 1, .. })
        ));
        coord.open_epoch(1).unwrap();
        assert!(coord.open_epoch(2).is_err());
    }

    #[tokio::test]
    async fn test_disagreement_keeps_forming_then_times_out() {
        let coord = build(2, fast_config()).resume_after(4);
        coord.open_epoch(5).unwrap();

        coord.propose(5, "w0", workers(2)).unwrap();
        let err = coord.propose(5, "w1", vec!["w1".to_string()]).unwrap_err();
        assert!(matches!(err, Error::AssumptionViolation { .. }));
        assert_eq!(coord.phase(5), Some(EpochPhase::Forming));

        let waited = coord.await_agreement(5).await;
        assert!(matches!(waited, Err(Error::EpochTimeout { epoch: 5, .. })));
        assert_eq!(coord.phase(5), Some(EpochPhase::Aborted));
    }

    #[tokio::test]
    async fn test_concurrent_agreement() {
        let coord = coordinator(3, fast_config());
        coord.open_epoch(1).unwrap();

        let mut waits = Vec::new();
        for w in workers(3) {
            let coord = coord.clone();
            waits.push(tokio::spawn(async move {
                coord.propose(1, &w, workers(3)).unwrap();
                coord.await_agreement(1).await
            }));
        }
        for wait in waits {
            assert_eq!(wait.await.unwrap().unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_worker_failure_aborts_and_allows_retry() {
        let coord = coordinator(2, fast_config());
        coord.open_epoch(1).unwrap();
        coord.propose(1, "w0", workers(2)).unwrap();
        coord.propose(1, "w1", workers(2)).unwrap();
        coord.report_step(1, "w0").unwrap();

        coord.worker_failed("w1");
        assert_eq!(coord.phase(1), Some(EpochPhase::Aborted));
        assert!(matches!(
            coord.await_closed(1).await,
            Err(Error::EpochAborted { .. })
        ));

        // Retry without the failed worker
        assert_eq!(coord.attempt(1), Some(1));
        assert_eq!(coord.open_epoch(1).unwrap(), vec!["w0".to_string()]);
        assert_eq!(coord.phase(1), Some(EpochPhase::Forming));
        assert_eq!(coord.attempt(1), Some(2));
    }

    #[tokio::test]
    async fn test_close_timeout_aborts() {
        let coord = coordinator(2, fast_config());
        coord.open_epoch(1).unwrap();
        coord.propose(1, "w0", workers(2)).unwrap();
        coord.propose(1, "w1", workers(2)).unwrap();
        coord.report_step(1, "w0").unwrap();

        assert!(matches!(
            coord.await_closed(1).await,
            Err(Error::EpochTimeout { .. })
        ));
        assert_eq!(coord.phase(1), Some(EpochPhase::Aborted));
        assert_eq!(coord.last_closed(), None);
    }

    #[tokio::test]
    async fn test_log_records_inputs_and_transitions() {
        let coord = coordinator(1, fast_config());
        coord.open_epoch(1).unwrap();
        coord.propose(1, "w0", workers(1)).unwrap();
        coord.report_step(1, "w0").unwrap();

        let phases: Vec<EpochPhase> = coord
            .log()
            .events()
            .into_iter()
            .filter_map(|(_, event)| match event {
                ProtocolEvent::EpochTransition { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                EpochPhase::Forming,
                EpochPhase::Agreed,
                EpochPhase::Executing,
                EpochPhase::Closing,
                EpochPhase::Closed
            ]
        );
        assert_eq!(coord.log().inputs().len(), 3);
    }

    #[test]
    fn test_check_liveness_aborts_open_epoch() {
        let config = CoordinatorConfig {
            heartbeat_timeout: Duration::from_millis(50),
            liveness_check_interval: Duration::from_millis(10),
            ..fast_config()
        };
        let coord = coordinator(2, config);
        coord.open_epoch(1).unwrap();

        // Heartbeats are wall-clock based
        std::thread::sleep(Duration::from_millis(80));
        let dead = coord.check_liveness();
        assert_eq!(dead, workers(2));
        assert_eq!(coord.phase(1), Some(EpochPhase::Aborted));
    }
}

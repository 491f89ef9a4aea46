//! Cohort driver
//!
//! Runs every manifest worker through epochs `next..=target` in process.
//! A failed epoch rolls the cohort back: every incarnation is halted, the
//! newest checkpoint no later than the last closed epoch becomes the
//! recovery point, commits past it are discarded, and a fresh coordinator
//! and a new generation of incarnations resume from there. Fatal and
//! non-retryable errors end the run instead, as does running out of
//! rollbacks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use checkpoint::{CommitCoordinator, CommitCoordinatorHandle, CommitMarker, StorageCheckpointStore};
use coordinator::{Coordinator, CoordinatorHandle};
use effect_log::EffectLog;
use resource::BackendHandle;
use runtime_core::{
    CheckpointId, Epoch, Error, ExecutionMode, Result, RunManifest, RuntimeConfig, RuntimeContext,
    WorkerId, WorkerRegistry,
};
use storage::StorageHandle;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use workflow::WorkflowGraph;

use crate::executor::WorkerExecutor;

/// A finished worker incarnation
#[derive(Debug, Clone)]
pub struct Incarnation {
    pub worker: WorkerId,
    pub generation: u32,
    pub mode: ExecutionMode,
    pub restored_from: Option<CheckpointId>,
    pub log: EffectLog,
}

/// Outcome of a cohort run
#[derive(Debug)]
pub struct JobReport {
    pub run_id: String,
    /// Distinguishes runs of the same manifest
    pub session: Uuid,
    pub target_epoch: Epoch,
    pub last_closed: Option<Epoch>,
    pub rollbacks: u32,
    pub latest_checkpoint: Option<CommitMarker>,
    pub coordinator_log: EffectLog,
    /// Every incarnation, in generation then manifest order
    pub incarnations: Vec<Incarnation>,
    pub failure: Option<Error>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Incarnations of the newest generation
    pub fn final_generation(&self) -> Vec<&Incarnation> {
        let newest = self.incarnations.iter().map(|i| i.generation).max();
        self.incarnations
            .iter()
            .filter(|i| Some(i.generation) == newest)
            .collect()
    }

    /// Write the coordinator log and every incarnation log under `dir`
    pub fn persist_logs(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir
            .as_ref()
            .join(format!("{}-{}", self.run_id, self.session.simple()));
        std::fs::create_dir_all(&dir)?;

        let mut written = Vec::with_capacity(self.incarnations.len() + 1);
        let logs = std::iter::once(&self.coordinator_log).chain(self.incarnations.iter().map(|i| &i.log));
        for log in logs {
            let path = dir.join(format!("{}.log", log.name()));
            log.persist(&path)?;
            written.push(path);
        }
        info!(dir = %dir.display(), logs = written.len(), "Effect logs persisted");
        Ok(written)
    }
}

/// Drives a cohort of in-process workers
pub struct CohortJob {
    config: RuntimeConfig,
    manifest: RunManifest,
    graph: Arc<WorkflowGraph>,
    backend: BackendHandle,
    storage: StorageHandle,
}

impl CohortJob {
    pub fn new(
        config: RuntimeConfig,
        manifest: RunManifest,
        graph: WorkflowGraph,
        backend: BackendHandle,
        storage: StorageHandle,
    ) -> Result<Self> {
        config.validate()?;
        manifest.validate()?;
        Ok(Self {
            config,
            manifest,
            graph: Arc::new(graph),
            backend,
            storage,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Run until epoch `target` closes or the run fails
    pub async fn run(&self, target: Epoch) -> JobReport {
        let mut report = JobReport {
            run_id: self.manifest.run_id.clone(),
            session: Uuid::new_v4(),
            target_epoch: target,
            last_closed: None,
            rollbacks: 0,
            latest_checkpoint: None,
            coordinator_log: EffectLog::with_tail_capacity("coordinator", self.config.log.tail_capacity),
            incarnations: Vec::new(),
            failure: None,
        };
        if let Err(err) = self.drive(target, &mut report).await {
            error!(run_id = %report.run_id, code = %err.code(), error = %err, "Run failed");
            report.failure = Some(err);
        }
        report
    }

    #[instrument(skip(self, report), fields(run_id = %self.manifest.run_id, session = %report.session))]
    async fn drive(&self, target: Epoch, report: &mut JobReport) -> Result<()> {
        let store = Arc::new(StorageCheckpointStore::new(
            Arc::clone(&self.storage),
            self.config.checkpoint.prefix.clone(),
        ));
        let commits: CommitCoordinatorHandle = Arc::new(CommitCoordinator::new(
            store,
            self.config.checkpoint.clone(),
            report.coordinator_log.clone(),
        ));
        commits.collect_garbage().await?;

        let mut resume = commits.latest_committed().await?;
        let mut generation = 0;
        loop {
            let coordinator = self.coordinator(resume.as_ref(), report.coordinator_log.clone())?;
            let executors = self.incarnations(&coordinator, &commits, generation)?;
            let restored_from = resume.as_ref().map(|m| m.checkpoint.clone());

            let outcome = match &resume {
                Some(marker) => match restore_all(&executors, marker).await {
                    Ok(()) => self.run_epochs(&coordinator, &executors, target).await,
                    Err(err) => Err(err),
                },
                None => self.run_epochs(&coordinator, &executors, target).await,
            };

            let reason = outcome.as_ref().err().map(|e| format!("{}: {}", e.code(), e));
            for executor in &executors {
                let mode = executor.halt(reason.clone());
                report.incarnations.push(Incarnation {
                    worker: executor.worker_id().to_string(),
                    generation,
                    mode,
                    restored_from: restored_from.clone(),
                    log: executor.log().clone(),
                });
            }
            report.last_closed = coordinator.last_closed();
            report.latest_checkpoint = commits.latest_committed().await?;

            let err = match outcome {
                Ok(()) => {
                    info!(
                        last_closed = ?report.last_closed,
                        rollbacks = report.rollbacks,
                        "Run complete"
                    );
                    return Ok(());
                }
                Err(err) => err,
            };
            if err.is_fatal() || !err.is_retryable() {
                return Err(err);
            }
            if report.rollbacks >= self.config.coordinator.max_rollbacks {
                warn!(rollbacks = report.rollbacks, "Rollback limit reached");
                return Err(err);
            }

            resume = commits.recovery_point(coordinator.last_closed()).await?;
            let discarded = commits.discard_after(resume.as_ref().map(|m| m.epoch)).await?;
            report.rollbacks += 1;
            generation += 1;
            warn!(
                code = %err.code(),
                error = %err,
                recovery_epoch = ?resume.as_ref().map(|m| m.epoch),
                discarded = discarded.len(),
                generation,
                "Rolling back"
            );
        }
    }

    /// Fresh coordinator numbering epochs after `resume`
    fn coordinator(&self, resume: Option<&CommitMarker>, log: EffectLog) -> Result<CoordinatorHandle> {
        let registry = Arc::new(WorkerRegistry::new(self.config.coordinator.heartbeat_timeout));
        let mut coordinator =
            Coordinator::new(&self.manifest, self.config.coordinator.clone(), registry, log);
        if let Some(marker) = resume {
            coordinator = coordinator.resume_after(marker.epoch);
        }
        for worker in &self.manifest.workers {
            coordinator.register_worker(worker)?;
        }
        Ok(Arc::new(coordinator))
    }

    fn incarnations(
        &self,
        coordinator: &CoordinatorHandle,
        commits: &CommitCoordinatorHandle,
        generation: u32,
    ) -> Result<Vec<Arc<WorkerExecutor>>> {
        self.manifest
            .workers
            .iter()
            .map(|worker| {
                let ctx = RuntimeContext::new(worker.clone(), self.config.clone(), self.manifest.clone())?;
                let log = EffectLog::with_tail_capacity(
                    format!("{}.g{}", worker, generation),
                    self.config.log.tail_capacity,
                );
                let executor = WorkerExecutor::new(
                    ctx,
                    log,
                    Arc::clone(&self.backend),
                    Arc::clone(coordinator),
                    Arc::clone(commits),
                    Arc::clone(&self.graph),
                    generation,
                )?;
                Ok(Arc::new(executor))
            })
            .collect()
    }

    async fn run_epochs(
        &self,
        coordinator: &CoordinatorHandle,
        executors: &[Arc<WorkerExecutor>],
        target: Epoch,
    ) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let monitor = coordinator.spawn_liveness_monitor(shutdown_rx);

        let mut result = Ok(());
        for epoch in coordinator.next_epoch()..=target {
            if let Err(err) = run_epoch(executors, epoch).await {
                result = Err(err);
                break;
            }
            info!(epoch, "Epoch closed");
        }

        let _ = shutdown_tx.send(());
        if let Err(e) = monitor.await {
            warn!(error = %e, "Liveness monitor ended abnormally");
        }
        result
    }
}

impl std::fmt::Debug for CohortJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohortJob")
            .field("run_id", &self.manifest.run_id)
            .field("workers", &self.manifest.workers.len())
            .field("nodes", &self.graph.len())
            .finish()
    }
}

async fn restore_all(executors: &[Arc<WorkerExecutor>], marker: &CommitMarker) -> Result<()> {
    for executor in executors {
        executor.restore(marker).await?;
    }
    Ok(())
}

/// Run one epoch on every worker concurrently
///
/// When several workers fail, the error reported is the most severe one,
/// ties going to the lowest rank: the worker whose node failed is usually
/// the cause, the others only saw the epoch abort.
async fn run_epoch(executors: &[Arc<WorkerExecutor>], epoch: Epoch) -> Result<()> {
    let mut tasks = JoinSet::new();
    for (rank, executor) in executors.iter().enumerate() {
        let executor = Arc::clone(executor);
        tasks.spawn(async move { (rank, executor.run_epoch(epoch).await) });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(step))) => {
                debug!(worker_id = %step.worker, epoch, executed = step.executed, "Worker finished epoch");
            }
            Ok((rank, Err(err))) => failures.push((rank, err)),
            Err(e) => failures.push((
                usize::MAX,
                Error::Internal {
                    message: format!("worker task ended abnormally: {}", e),
                },
            )),
        }
    }

    match failures
        .into_iter()
        .min_by_key(|(rank, err)| (severity(err), *rank))
    {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

fn severity(err: &Error) -> u8 {
    if err.is_fatal() {
        0
    } else if !err.is_retryable() {
        1
    } else if matches!(err, Error::CheckpointAborted { .. } | Error::CheckpointVoteFailed { .. }) {
        2
    } else {
        3
    }
}

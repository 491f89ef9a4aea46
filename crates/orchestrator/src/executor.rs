//! One worker incarnation executing workflow steps
//!
//! An incarnation owns a runtime context, a resource manager and its own
//! effect log, and runs one step of the workflow graph per epoch. Nodes are
//! issued in canonical schedule order; backend completions are awaited in
//! submission order, and only when a later node depends on them or the step
//! ends, so the log never depends on backend timing.
//!
//! Handles are step scoped: whatever is still allocated when a step ends is
//! released, oldest allocation first. A failure drains the in-flight nodes,
//! releases every handle and leaves the incarnation `Failed`; it never runs
//! another step.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use checkpoint::{checkpoint_id, CheckpointParticipant, CommitCoordinatorHandle, CommitMarker};
use coordinator::{CollectiveGroup, CoordinatorHandle};
use effect_log::{EffectLog, ProtocolInput};
use resource::{
    check_release, dispatch, AllocRequest, BackendHandle, CompletionToken, Handle, Invocation,
    PendingCompletion, ResourceManager, Submission,
};
use runtime_core::{
    CheckpointId, EffectKind, Epoch, Error, ExecutionMode, NodeId, Outcome, Result,
    RuntimeContext, WorkerId,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use workflow::{EffectNode, Schedule, Scheduler, WorkflowGraph};

/// What one successful step did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub worker: WorkerId,
    pub epoch: Epoch,
    pub attempt: u32,
    /// Nodes issued, in schedule order
    pub executed: usize,
    /// Handles still allocated when the step ended
    pub released: Vec<String>,
    pub checkpoints: Vec<CheckpointId>,
    /// Dataset partitions assigned to this worker for the epoch
    pub partitions: BTreeMap<String, Vec<u64>>,
}

/// Backend work submitted but not yet settled, oldest first
struct Inflight {
    queue: VecDeque<PendingCompletion>,
    settled: Vec<bool>,
}

impl Inflight {
    fn new(nodes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            settled: vec![false; nodes],
        }
    }

    fn is_settled(&self, node: NodeId) -> bool {
        self.settled.get(node.index()).copied().unwrap_or(false)
    }

    fn mark(&mut self, node: NodeId) {
        if let Some(slot) = self.settled.get_mut(node.index()) {
            *slot = true;
        }
    }
}

/// Executes workflow steps for one worker incarnation
pub struct WorkerExecutor {
    generation: u32,
    manager: ResourceManager,
    backend: BackendHandle,
    coordinator: CoordinatorHandle,
    commits: CommitCoordinatorHandle,
    participant: CheckpointParticipant,
    graph: Arc<WorkflowGraph>,
    schedule: Schedule,
}

impl WorkerExecutor {
    /// Set up an incarnation; refuses a backend the manifest does not pin
    pub fn new(
        ctx: RuntimeContext,
        log: EffectLog,
        backend: BackendHandle,
        coordinator: CoordinatorHandle,
        commits: CommitCoordinatorHandle,
        graph: Arc<WorkflowGraph>,
        generation: u32,
    ) -> Result<Self> {
        check_release(backend.as_ref(), &ctx.manifest().backend)?;
        let schedule = Scheduler::new(ctx.config().topology.clone(), ctx.rank()).schedule(&graph)?;
        if !schedule.is_deterministic() {
            warn!(
                worker_id = %ctx.worker_id(),
                "Workflow has asynchronous collectives; its runs are not reproducible"
            );
        }

        let participant = CheckpointParticipant::new(
            ctx.worker_id(),
            Arc::clone(commits.store()),
            Arc::clone(&commits),
        );
        Ok(Self {
            generation,
            manager: ResourceManager::new(ctx, log),
            backend,
            coordinator,
            commits,
            participant,
            graph,
            schedule,
        })
    }

    pub fn worker_id(&self) -> &str {
        self.manager.context().worker_id()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn context(&self) -> &RuntimeContext {
        self.manager.context()
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    pub fn log(&self) -> &EffectLog {
        self.manager.log()
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn mode(&self) -> ExecutionMode {
        self.manager.context().mode()
    }

    /// Load this worker's shard of a committed checkpoint into the backend
    ///
    /// Returns `None` when the worker was not in the checkpoint's group and
    /// so has nothing to restore.
    pub async fn restore(&self, marker: &CommitMarker) -> Result<Option<Bytes>> {
        let worker = self.worker_id();
        let Some(shard) = marker.shard_of(worker) else {
            warn!(
                worker_id = %worker,
                checkpoint_id = %marker.checkpoint,
                "Worker wrote no shard of the checkpoint; starting empty"
            );
            return Ok(None);
        };
        let data = self.commits.load_shard(marker, shard).await?;
        self.backend.restore(worker, data.clone()).await?;
        info!(
            worker_id = %worker,
            checkpoint_id = %marker.checkpoint,
            epoch = marker.epoch,
            shard,
            size_bytes = data.len(),
            "Restored shard"
        );
        Ok(Some(data))
    }

    /// Open `epoch` if needed, propose the candidates and wait for agreement
    pub async fn join_epoch(&self, epoch: Epoch) -> Result<CollectiveGroup> {
        let worker = self.worker_id();
        self.coordinator.heartbeat(worker, epoch)?;
        let candidates = self.coordinator.open_epoch(epoch)?;
        if !candidates.iter().any(|c| c == worker) {
            return Err(Error::NotAMember {
                epoch,
                worker_id: worker.to_string(),
            });
        }
        self.coordinator.propose(epoch, worker, candidates)?;
        self.coordinator.await_agreement(epoch).await
    }

    /// Join `epoch`, run its step and wait for every member to finish
    ///
    /// Heartbeats continue in the background until the epoch is over, so a
    /// long step is never mistaken for a dead worker.
    pub async fn run_epoch(&self, epoch: Epoch) -> Result<StepReport> {
        let _heartbeat = self.spawn_heartbeat(epoch);
        let group = self.join_epoch(epoch).await?;
        let report = self.run_step(epoch, &group).await?;
        self.coordinator.await_closed(epoch).await?;
        Ok(report)
    }

    /// Refresh this worker's heartbeat every `heartbeat_period` until dropped
    fn spawn_heartbeat(&self, epoch: Epoch) -> HeartbeatTask {
        let coordinator = Arc::clone(&self.coordinator);
        let worker = self.worker_id().to_string();
        let period = coordinator.config().heartbeat_period();
        HeartbeatTask(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.heartbeat(&worker, epoch) {
                    warn!(worker_id = %worker, epoch, error = %e, "Heartbeat rejected");
                    break;
                }
            }
        }))
    }

    /// Run one step of the graph for `epoch` and report it to the coordinator
    #[instrument(skip(self, group), fields(worker_id = %self.worker_id(), generation = self.generation))]
    pub async fn run_step(&self, epoch: Epoch, group: &CollectiveGroup) -> Result<StepReport> {
        let mode = self.mode();
        if mode != ExecutionMode::Running {
            return Err(Error::ExecutionHalted {
                mode,
                operation: format!("step {}", epoch),
            });
        }

        let partitions = self.partitions(epoch)?;
        self.log().input(ProtocolInput::StepStarted { epoch });
        let mut report = StepReport {
            worker: self.worker_id().to_string(),
            epoch,
            attempt: self.coordinator.attempt(epoch).unwrap_or(1),
            executed: 0,
            released: Vec::new(),
            checkpoints: Vec::new(),
            partitions,
        };
        let mut inflight = Inflight::new(self.graph.len());

        match self.execute(epoch, group, &mut inflight, &mut report).await {
            Ok(()) => {
                report.released = self.manager.release_all()?;
                self.coordinator.report_step(epoch, self.worker_id())?;
                info!(
                    epoch,
                    executed = report.executed,
                    released = report.released.len(),
                    checkpoints = report.checkpoints.len(),
                    "Step complete"
                );
                Ok(report)
            }
            Err(err) => {
                error!(epoch, code = %err.code(), error = %err, "Step failed");
                self.abandon(&err, inflight).await;
                self.coordinator.worker_failed(self.worker_id());
                Err(err)
            }
        }
    }

    fn partitions(&self, epoch: Epoch) -> Result<BTreeMap<String, Vec<u64>>> {
        let ctx = self.manager.context();
        let manifest = ctx.manifest();
        manifest
            .datasets
            .iter()
            .map(|d| {
                let assigned = manifest.partitions_for(&d.dataset_id, epoch, ctx.rank())?;
                Ok((d.dataset_id.clone(), assigned))
            })
            .collect()
    }

    async fn execute(
        &self,
        epoch: Epoch,
        group: &CollectiveGroup,
        inflight: &mut Inflight,
        report: &mut StepReport,
    ) -> Result<()> {
        let ctx = self.manager.context();
        let seed = ctx.manifest().derive_seed(epoch, ctx.rank());
        let mut bindings: HashMap<String, Handle> = HashMap::new();

        for entry in self.schedule.iter() {
            let node = self.graph.node(entry.node).ok_or_else(|| Error::Internal {
                message: format!("schedule names unknown node {}", entry.node),
            })?;
            while node.predecessors().iter().any(|p| !inflight.is_settled(*p)) {
                self.settle_next(inflight).await?;
            }

            debug!(node = %node.id(), name = node.name(), queue = %entry.queue, "Issuing node");
            report.executed += 1;
            match node.kind() {
                EffectKind::Alloc => {
                    let name = lifecycle_handle(node)?;
                    let decl = self.graph.handle(name).ok_or_else(|| Error::UnboundHandle {
                        node: node.id(),
                        name: name.to_string(),
                    })?;
                    let handle = self.manager.alloc(AllocRequest {
                        node: Some(node.id()),
                        footprint: node.footprint().digest(),
                        label: name.to_string(),
                        class: decl.class,
                        size_bytes: decl.size_bytes,
                    })?;
                    bindings.insert(name.to_string(), handle);
                }
                EffectKind::Free => {
                    let name = lifecycle_handle(node)?;
                    let handle = bindings.remove(name).ok_or_else(|| {
                        self.reject(
                            node,
                            Error::UnboundHandle {
                                node: node.id(),
                                name: name.to_string(),
                            },
                        )
                    })?;
                    self.manager
                        .free(Some(node.id()), node.footprint().digest(), &handle)?;
                }
                EffectKind::Barrier => {}
                EffectKind::Checkpoint => {
                    let (token, invocation) = self
                        .submit(node, epoch, seed, &bindings)
                        .map_err(|e| self.reject(node, e))?;
                    let committed = self.checkpoint(&invocation, epoch, report.attempt, group).await;
                    let outcome = match &committed {
                        Ok(_) => Outcome::Succeeded,
                        Err(e) => Outcome::failed(e.to_string()),
                    };
                    self.manager.complete(&token, outcome)?;
                    inflight.mark(token.node());
                    report.checkpoints.push(committed?.checkpoint);
                }
                EffectKind::Copy | EffectKind::Compute | EffectKind::Collective => {
                    if node.kind() == EffectKind::Collective {
                        self.coordinator
                            .check_collective(epoch, self.worker_id(), node.name())
                            .map_err(|e| self.reject(node, e))?;
                    }
                    let (token, invocation) = self
                        .submit(node, epoch, seed, &bindings)
                        .map_err(|e| self.reject(node, e))?;
                    inflight.queue.push_back(dispatch(
                        Arc::clone(&self.backend),
                        token,
                        invocation,
                        node.error_policy().attempts(),
                    ));
                }
            }
            if !node.kind().needs_backend() {
                inflight.mark(node.id());
            }
        }

        while !inflight.queue.is_empty() {
            self.settle_next(inflight).await?;
        }
        Ok(())
    }

    /// Wait for the oldest submitted node and record its outcome
    async fn settle_next(&self, inflight: &mut Inflight) -> Result<()> {
        let pending = inflight.queue.pop_front().ok_or_else(|| Error::Internal {
            message: "waiting on a node that was never submitted".to_string(),
        })?;
        let (token, outcome) = pending.wait().await;
        self.manager.complete(&token, outcome.clone())?;
        inflight.mark(token.node());
        match outcome {
            Outcome::Succeeded => Ok(()),
            Outcome::Failed { reason } => Err(Error::Backend {
                node: token.node(),
                message: reason,
            }),
        }
    }

    /// Resolve `node`'s footprint and hand it to the resource manager
    fn submit(
        &self,
        node: &EffectNode,
        epoch: Epoch,
        seed: u64,
        bindings: &HashMap<String, Handle>,
    ) -> Result<(CompletionToken, Invocation)> {
        let resolve = |names: Vec<&str>| -> Result<Vec<Handle>> {
            names
                .into_iter()
                .map(|name| {
                    bindings.get(name).copied().ok_or_else(|| Error::UnboundHandle {
                        node: node.id(),
                        name: name.to_string(),
                    })
                })
                .collect()
        };
        let reads = resolve(node.footprint().reads().collect())?;
        let writes = resolve(node.footprint().writes().collect())?;

        let token = self.manager.submit(Submission {
            node: node.id(),
            kind: node.kind(),
            footprint: node.footprint().digest(),
            reads: reads.clone(),
            writes: writes.clone(),
        })?;
        let invocation = Invocation {
            worker: self.worker_id().to_string(),
            epoch,
            node: node.id(),
            name: node.name().to_string(),
            kind: node.kind(),
            reads,
            writes,
            seed,
            attempt: 1,
        };
        Ok((token, invocation))
    }

    /// Record a node that failed before reaching the resource manager
    fn reject(&self, node: &EffectNode, err: Error) -> Error {
        self.log()
            .outcome(Some(node.id()), node.kind(), Outcome::failed(err.to_string()));
        err
    }

    async fn checkpoint(
        &self,
        invocation: &Invocation,
        epoch: Epoch,
        attempt: u32,
        group: &CollectiveGroup,
    ) -> Result<CommitMarker> {
        let worker = self.worker_id();
        if !group.contains(worker) {
            return Err(Error::NotAMember {
                epoch,
                worker_id: worker.to_string(),
            });
        }
        let id = checkpoint_id(self.generation, epoch, attempt, &invocation.name);

        match self.backend.snapshot(invocation).await {
            Ok(data) => {
                self.participant
                    .commit_shard(&id, epoch, group.members(), data)
                    .await
            }
            Err(err) => {
                warn!(checkpoint_id = %id, error = %err, "Snapshot failed; voting no");
                self.participant.decline(&id, epoch, group.members()).await?;
                Err(err)
            }
        }
    }

    /// Enter cleanup after `err`, drain in-flight work and release everything
    async fn abandon(&self, err: &Error, mut inflight: Inflight) {
        self.manager
            .begin_cleanup(Some(format!("{}: {}", err.code(), err)));
        while let Some(pending) = inflight.queue.pop_front() {
            let (token, outcome) = pending.wait().await;
            if let Err(e) = self.manager.complete(&token, outcome) {
                warn!(node = %token.node(), error = %e, "Failed to record drained completion");
            }
        }
        self.wind_down();
    }

    fn wind_down(&self) -> ExecutionMode {
        match self.manager.release_all() {
            Ok(released) if !released.is_empty() => {
                debug!(worker_id = %self.worker_id(), released = ?released, "Released handles");
            }
            Ok(_) => {}
            Err(e) => warn!(worker_id = %self.worker_id(), error = %e, "Failed to release handles"),
        }
        match self.manager.finish() {
            Ok(mode) => {
                info!(worker_id = %self.worker_id(), mode = %mode, "Incarnation finished");
                mode
            }
            Err(e) => {
                error!(worker_id = %self.worker_id(), error = %e, "Incarnation could not finish");
                self.mode()
            }
        }
    }

    /// End this incarnation between steps
    ///
    /// `None` finishes it normally; a reason marks it failed. Returns the
    /// final mode. An incarnation that already finished is left alone.
    pub fn halt(&self, reason: Option<String>) -> ExecutionMode {
        let mode = self.mode();
        if mode.is_terminal() {
            return mode;
        }
        self.log().input(ProtocolInput::Halted {
            reason: reason.clone(),
        });
        self.manager.begin_cleanup(reason);
        self.wind_down()
    }
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("worker_id", &self.worker_id())
            .field("generation", &self.generation)
            .field("mode", &self.mode())
            .field("nodes", &self.graph.len())
            .finish()
    }
}

/// Background heartbeat for one epoch; stops when dropped
struct HeartbeatTask(JoinHandle<()>);

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn lifecycle_handle(node: &EffectNode) -> Result<&str> {
    node.lifecycle_handle().ok_or_else(|| Error::Internal {
        message: format!("{} '{}' names no handle", node.kind(), node.name()),
    })
}

//! Lifecycle, membership and commit scenarios across crate boundaries

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use checkpoint::{CheckpointParticipant, CheckpointStore, CommitCoordinator, StorageCheckpointStore};
use coordinator::Coordinator;
use effect_log::{EffectLog, ProtocolEvent, ProtocolInput};
use orchestrator::replay_coordinator;
use resource::{AllocRequest, ResourceManager, SimulatedBackend, Submission};
use runtime_core::config::{CheckpointConfig, CoordinatorConfig};
use runtime_core::{
    CheckpointStatus, EffectKind, EpochPhase, Error, ErrorClass, NodeId, Outcome, ResourceClass,
    RuntimeContextBuilder, WorkerRegistry,
};
use storage::{MemoryStorage, StorageBackend};
use workflow::{GraphBuilder, Scheduler};

#[tokio::test]
async fn test_free_waits_for_write_completion() -> Result<()> {
    common::init_tracing();

    let mut b = GraphBuilder::named("lifecycle");
    b.handle("A", ResourceClass::Buffer, 64);
    let alloc = b.alloc("alloc", "A");
    let write = b.compute("write", &[], &["A"]);
    let free = b.free("free", "A");
    let graph = b.build()?;

    // The scheduler never offers the free before the write
    let schedule = Scheduler::new(Default::default(), 0).schedule(&graph)?;
    assert!(graph.is_ordered_before(write, free));
    assert_eq!(schedule.order(), vec![alloc, write, free]);

    let ctx = RuntimeContextBuilder::new("w0", common::manifest("run-uaf", 1)).build()?;
    let manager = ResourceManager::new(ctx, EffectLog::new("w0"));
    let handle = manager.alloc(AllocRequest {
        node: Some(alloc),
        footprint: 0,
        label: "A".to_string(),
        class: ResourceClass::Buffer,
        size_bytes: 64,
    })?;
    let token = manager.submit(Submission {
        node: write,
        kind: EffectKind::Compute,
        footprint: 0,
        reads: Vec::new(),
        writes: vec![handle],
    })?;

    // Issued out of order anyway, the manager refuses
    let early = manager.free(Some(free), 0, &handle);
    assert!(matches!(early, Err(Error::UseAfterFreeOrDoubleFree { .. })));

    manager.complete(&token, Outcome::Succeeded)?;
    manager.free(Some(free), 0, &handle)?;

    let again = manager.free(Some(free), 0, &handle).unwrap_err();
    assert!(matches!(again, Error::UseAfterFreeOrDoubleFree { .. }));
    assert_eq!(again.class(), ErrorClass::Resource);
    assert!(again.is_fatal());
    assert!(manager.live_handles().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_membership_disagreement_never_agrees() -> Result<()> {
    common::init_tracing();

    let manifest = common::manifest("run-members", 2);
    let config = CoordinatorConfig {
        agreement_timeout: Duration::from_millis(200),
        ..CoordinatorConfig::default()
    };
    let registry = Arc::new(WorkerRegistry::new(config.heartbeat_timeout));
    let coordinator = Coordinator::new(&manifest, config, registry, EffectLog::new("coordinator"))
        .resume_after(4);
    for worker in &manifest.workers {
        coordinator.register_worker(worker)?;
    }

    let candidates = coordinator.open_epoch(5)?;
    assert_eq!(candidates, common::workers(2));
    assert_eq!(coordinator.propose(5, "w0", candidates.clone())?, EpochPhase::Forming);

    let err = coordinator
        .propose(5, "w1", vec!["w1".to_string()])
        .unwrap_err();
    assert!(matches!(err, Error::AssumptionViolation { .. }));
    assert_eq!(err.class(), ErrorClass::AssumptionViolation);
    assert!(err.is_fatal());
    assert_eq!(coordinator.phase(5), Some(EpochPhase::Forming));

    // No majority decision: the barrier times out instead
    let waited = coordinator.await_agreement(5).await.unwrap_err();
    assert!(matches!(waited, Error::EpochTimeout { .. }));
    assert!(!coordinator.log().events().iter().any(|(_, e)| matches!(
        e,
        ProtocolEvent::EpochTransition {
            phase: EpochPhase::Agreed,
            ..
        }
    )));
    Ok(())
}

#[tokio::test]
async fn test_vote_timeout_collects_every_shard() -> Result<()> {
    common::init_tracing();

    let storage = Arc::new(MemoryStorage::new());
    // The fourth shard lands long after the vote deadline
    storage.delay_writes_matching("checkpoints/ckpt-slow/shards/3-", Duration::from_millis(400));

    let log = EffectLog::new("coordinator");
    let store: Arc<dyn CheckpointStore> =
        Arc::new(StorageCheckpointStore::new(storage.clone(), "checkpoints"));
    let commits = Arc::new(CommitCoordinator::new(
        store.clone(),
        CheckpointConfig {
            vote_timeout: Duration::from_millis(100),
            ..CheckpointConfig::default()
        },
        log.clone(),
    ));

    let members = common::workers(4);
    let mut tasks = Vec::new();
    for (shard, worker) in members.iter().enumerate() {
        let participant = CheckpointParticipant::new(worker.clone(), store.clone(), commits.clone());
        let members = members.clone();
        tasks.push(tokio::spawn(async move {
            let data = Bytes::from(format!("shard {}", shard));
            participant.commit_shard("ckpt-slow", 7, &members, data).await
        }));
    }
    for task in tasks {
        let result = task.await?;
        assert!(matches!(result, Err(Error::CheckpointAborted { .. })), "{:?}", result);
    }

    assert_eq!(commits.status("ckpt-slow"), Some(CheckpointStatus::Aborted));
    assert!(storage.is_empty(), "{} objects left behind", storage.len());
    assert!(!storage.exists("checkpoints/ckpt-slow/COMMIT").await?);
    assert!(commits.latest_committed().await?.is_none());

    assert!(log
        .inputs()
        .iter()
        .any(|i| matches!(i, ProtocolInput::VoteTimeout { .. })));
    for report in replay_coordinator(&log) {
        assert!(report.is_consistent(), "{}", report);
    }
    Ok(())
}

#[tokio::test]
async fn test_unpinned_backend_stops_the_run() -> Result<()> {
    common::init_tracing();

    let backend = Arc::new(
        SimulatedBackend::new().with_release(runtime_core::BackendRelease::new("simulated", "0.0.0-other")),
    );
    let job = common::cohort("run-pinned", 2, backend, Arc::new(MemoryStorage::new()))?;
    let report = job.run(1).await;

    let failure = report.failure.expect("run must fail");
    assert!(matches!(failure, Error::ManifestMismatch { .. }));
    assert_eq!(failure.class(), ErrorClass::Config);
    assert!(report.incarnations.is_empty());
    Ok(())
}

//! End-to-end cohort runs with rollback and log replay

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use effect_log::{EffectLog, ProtocolEvent, ProtocolInput, Record};
use orchestrator::{replay_job, replay_worker};
use resource::{Fault, SimulatedBackend};
use runtime_core::{EpochPhase, Error, ExecutionMode};
use storage::MemoryStorage;
use workflow::Scheduler;

#[tokio::test]
async fn test_rollback_run_replays_consistently() -> Result<()> {
    common::init_tracing();

    let storage = Arc::new(MemoryStorage::new());
    // w2's shard of the first generation's epoch 3 checkpoint cannot be written
    storage.fail_writes_matching("checkpoints/ckpt-00000003-0000.1-save/shards/2-");
    let job = common::cohort("run-rollback", 3, Arc::new(SimulatedBackend::new()), storage.clone())?;

    let report = job.run(4).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(report.rollbacks, 1);
    assert_eq!(report.last_closed, Some(4));
    assert_eq!(report.incarnations.len(), 6);

    let resumed = report.final_generation();
    assert_eq!(resumed.len(), 3);
    assert!(resumed.iter().all(|i| i.mode == ExecutionMode::Done));
    assert!(resumed.iter().all(|i| i
        .restored_from
        .as_deref()
        .is_some_and(|id| id.starts_with("ckpt-00000002-0000"))));

    let replays = replay_job(&job, &report)?;
    assert_eq!(replays.len(), report.incarnations.len() + 2);
    for replay in &replays {
        assert!(replay.is_consistent(), "{}", replay);
    }
    Ok(())
}

#[tokio::test]
async fn test_persisted_logs_replay_and_tampering_is_caught() -> Result<()> {
    common::init_tracing();

    let dir = tempfile::tempdir()?;
    let job = common::cohort(
        "run-persist",
        2,
        Arc::new(SimulatedBackend::new()),
        Arc::new(MemoryStorage::new()),
    )?;
    let report = job.run(2).await;
    assert!(report.succeeded(), "{:?}", report.failure);

    let paths = report.persist_logs(dir.path())?;
    assert_eq!(paths.len(), 3);
    let schedule = Scheduler::new(job.config().topology.clone(), 0).schedule(job.graph())?;
    let loaded = EffectLog::load(&paths[1])?;
    assert_eq!(loaded.name(), "w0.g0");
    assert!(replay_worker(job.graph(), &schedule, &loaded).is_consistent());

    // Drop the first free from an otherwise identical log
    let tampered = EffectLog::new(loaded.name());
    let mut skipped = false;
    for entry in loaded.cursor() {
        if !skipped && matches!(entry.record, Record::Event(ProtocolEvent::Freed { .. })) {
            skipped = true;
            continue;
        }
        tampered.append(entry.node, entry.record);
    }
    let replay = replay_worker(job.graph(), &schedule, &tampered);
    let divergence = replay.divergence.clone().expect("tampered log must diverge");
    assert!(matches!(divergence.expected, Some(ProtocolEvent::Freed { .. })));
    assert!(matches!(replay.into_result(), Err(Error::Internal { .. })));
    Ok(())
}

#[tokio::test]
async fn test_worker_backend_failure_is_terminal() -> Result<()> {
    common::init_tracing();

    let backend = Arc::new(SimulatedBackend::new());
    backend.inject(Fault::always("update#1").on_worker("w1").in_epoch(2));
    let job = common::cohort("run-backend", 2, backend, Arc::new(MemoryStorage::new()))?;

    let report = job.run(3).await;
    assert!(matches!(report.failure, Some(Error::Backend { .. })));
    assert_eq!(report.rollbacks, 0);
    assert_eq!(report.last_closed, Some(1));
    assert!(report.incarnations.iter().all(|i| i.mode == ExecutionMode::Failed));

    // Failed runs replay too
    for replay in replay_job(&job, &report)? {
        assert!(replay.is_consistent(), "{}", replay);
    }
    Ok(())
}

/// Workers reported failed by a `WorkerFailed` input in `log`
fn failed_workers(log: &EffectLog) -> Vec<(u64, String)> {
    log.cursor()
        .filter_map(|entry| match entry.record {
            Record::Input(ProtocolInput::WorkerFailed { epoch, worker }) => Some((epoch, worker)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_slow_steps_keep_workers_alive() -> Result<()> {
    common::init_tracing();

    // Every backend call outlasts the heartbeat timeout
    let backend = Arc::new(
        SimulatedBackend::new().with_latency(Duration::from_millis(200), Duration::ZERO),
    );
    let mut config = common::tight_heartbeats(common::config(), Duration::from_millis(150));
    config.coordinator.close_timeout = Duration::from_secs(10);
    let job = common::cohort_with(config, "run-slow", 2, backend, Arc::new(MemoryStorage::new()))?;

    let report = job.run(1).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(report.rollbacks, 0);
    assert_eq!(report.last_closed, Some(1));
    assert!(failed_workers(&report.coordinator_log).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stalled_worker_rolls_back_to_previous_checkpoint() -> Result<()> {
    common::init_tracing();

    // w1 hangs in its first forward pass of epoch 2, long past the vote timeout
    let backend = Arc::new(SimulatedBackend::new());
    backend.inject(
        Fault::stall("forward#0", Duration::from_millis(1200))
            .on_worker("w1")
            .in_epoch(2),
    );
    let config = common::tight_heartbeats(common::config(), Duration::from_millis(200));
    let storage = Arc::new(MemoryStorage::new());
    let job = common::cohort_with(config, "run-stall", 3, backend.clone(), storage)?;

    let report = job.run(3).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(report.rollbacks, 1);
    assert_eq!(report.last_closed, Some(3));

    // Epoch 2 aborted through the checkpoint vote, not by declaring w1 dead
    let aborted = report.coordinator_log.cursor().any(|entry| {
        entry.event()
            == Some(&ProtocolEvent::EpochTransition {
                epoch: 2,
                phase: EpochPhase::Aborted,
            })
    });
    assert!(aborted);
    let failed = failed_workers(&report.coordinator_log);
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|(epoch, worker)| *epoch == 2 && worker != "w1"), "{:?}", failed);

    let resumed = report.final_generation();
    assert_eq!(resumed.len(), 3);
    assert!(resumed.iter().all(|i| i.mode == ExecutionMode::Done));
    assert!(resumed.iter().all(|i| i
        .restored_from
        .as_deref()
        .is_some_and(|id| id.starts_with("ckpt-00000001-0000"))));

    // Each device was reloaded with its own epoch 1 shard
    let mut restored = backend.restored();
    restored.sort();
    assert_eq!(restored.len(), 3);
    for ((worker, data), expected) in restored.iter().zip(common::workers(3)) {
        assert_eq!(worker, &expected);
        assert!(data.starts_with(format!("{}|1|save|", expected).as_bytes()));
    }

    for replay in replay_job(&job, &report)? {
        assert!(replay.is_consistent(), "{}", replay);
    }
    Ok(())
}

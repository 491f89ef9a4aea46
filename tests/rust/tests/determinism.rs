//! Canonical schedules and timing-independent event streams

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use effect_log::ProtocolEvent;
use resource::SimulatedBackend;
use runtime_core::config::TopologyConfig;
use runtime_core::{CollectiveMode, EffectKind};
use storage::MemoryStorage;
use workflow::{GraphBuilder, GraphLimits, Scheduler, WorkflowSpec};

#[test]
fn test_identical_input_gives_identical_schedule() -> Result<()> {
    let topology = TopologyConfig {
        devices: 2,
        compute_streams: 3,
        copy_streams: 2,
    };

    let first = common::training_graph()?;
    let second = WorkflowSpec::from_json(common::TRAINING)?.build(GraphLimits::default())?;
    assert_eq!(first.fingerprint(), second.fingerprint());

    let a = Scheduler::new(topology.clone(), 1).schedule(&first)?;
    let b = Scheduler::new(topology.clone(), 1).schedule(&second)?;
    assert_eq!(a, b);
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert!(a.respects(&first));
    assert!(a.is_deterministic());

    // Another rank lands on another device but keeps the order
    let other = Scheduler::new(topology, 0).schedule(&first)?;
    assert_eq!(other.order(), a.order());
    assert_eq!(other.collective_sequence(), a.collective_sequence());
    assert!(other
        .iter()
        .zip(a.iter())
        .all(|(x, y)| x.queue.device != y.queue.device && x.queue.stream == y.queue.stream));
    Ok(())
}

#[test]
fn test_async_collective_marks_schedule_nondeterministic() -> Result<()> {
    let mut b = GraphBuilder::named("async");
    b.handle("grads", runtime_core::ResourceClass::Buffer, 64);
    b.alloc("alloc", "grads");
    b.collective("reduce", &["grads"], CollectiveMode::Asynchronous);
    b.free("free", "grads");
    let graph = b.build()?;

    let schedule = Scheduler::new(TopologyConfig::default(), 0).schedule(&graph)?;
    assert!(!schedule.is_deterministic());
    assert_eq!(schedule.collective_sequence().len(), 1);
    assert_eq!(schedule.entries()[1].kind, EffectKind::Collective);
    Ok(())
}

fn handle_and_mode_events(log: &effect_log::EffectLog) -> Vec<ProtocolEvent> {
    log.events()
        .into_iter()
        .map(|(_, event)| event)
        .filter(|e| {
            matches!(
                e,
                ProtocolEvent::Allocated { .. } | ProtocolEvent::Freed { .. } | ProtocolEvent::ModeChanged { .. }
            )
        })
        .collect()
}

#[tokio::test]
async fn test_backend_timing_does_not_change_events() -> Result<()> {
    common::init_tracing();

    let instant = common::cohort(
        "run-timing",
        3,
        Arc::new(SimulatedBackend::new()),
        Arc::new(MemoryStorage::new()),
    )?
    .run(2)
    .await;
    let jittery = common::cohort(
        "run-timing",
        3,
        Arc::new(SimulatedBackend::new().with_latency(Duration::from_millis(1), Duration::from_millis(4))),
        Arc::new(MemoryStorage::new()),
    )?
    .run(2)
    .await;

    assert!(instant.succeeded(), "{:?}", instant.failure);
    assert!(jittery.succeeded(), "{:?}", jittery.failure);
    assert_eq!(instant.incarnations.len(), jittery.incarnations.len());
    for (x, y) in instant.incarnations.iter().zip(&jittery.incarnations) {
        assert_eq!(x.worker, y.worker);
        assert_eq!(handle_and_mode_events(&x.log), handle_and_mode_events(&y.log));
    }
    assert_eq!(
        instant.latest_checkpoint.map(|m| m.checkpoint),
        jittery.latest_checkpoint.map(|m| m.checkpoint)
    );
    Ok(())
}

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orchestrator::CohortJob;
use resource::SimulatedBackend;
use runtime_core::{RunManifest, RuntimeConfig};
use storage::MemoryStorage;
use workflow::{GraphLimits, WorkflowGraph, WorkflowSpec};

/// Two inner iterations per step, a checkpoint, then cleanup
pub const TRAINING: &str = r#"{
    "name": "train",
    "handles": [
        {"name": "weights", "class": "buffer", "size_bytes": 4096},
        {"name": "grads", "class": "buffer", "size_bytes": 4096},
        {"name": "batch", "class": "buffer", "size_bytes": 1024}
    ],
    "templates": {
        "iteration": [
            {"effect": {"name": "load", "kind": "copy", "writes": ["batch"]}},
            {"effect": {"name": "forward", "kind": "compute", "reads": ["weights", "batch"], "writes": ["grads"]}},
            {"effect": {"name": "allreduce", "kind": "collective", "writes": ["grads"]}},
            {"effect": {"name": "update", "kind": "compute", "reads": ["grads"], "writes": ["weights"]}}
        ]
    },
    "steps": [
        {"effect": {"name": "alloc_weights", "kind": "alloc", "writes": ["weights"]}},
        {"effect": {"name": "alloc_grads", "kind": "alloc", "writes": ["grads"]}},
        {"effect": {"name": "alloc_batch", "kind": "alloc", "writes": ["batch"]}},
        {"repeat": {"times": 2, "body": [{"include": {"template": "iteration"}}]}},
        {"effect": {"name": "sync", "kind": "barrier"}},
        {"effect": {"name": "save", "kind": "checkpoint", "reads": ["weights"], "after": ["sync"]}},
        {"effect": {"name": "free_batch", "kind": "free", "writes": ["batch"]}},
        {"effect": {"name": "free_grads", "kind": "free", "writes": ["grads"]}}
    ]
}"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn training_graph() -> anyhow::Result<WorkflowGraph> {
    Ok(WorkflowSpec::from_json(TRAINING)?.build(GraphLimits::default())?)
}

pub fn workers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("w{}", i)).collect()
}

pub fn manifest(run_id: &str, n: usize) -> RunManifest {
    RunManifest::new(run_id, SimulatedBackend::default_release(), workers(n), 42)
}

pub fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.checkpoint.vote_timeout = Duration::from_millis(300);
    config.checkpoint.keep_count = 3;
    config.coordinator.agreement_timeout = Duration::from_secs(2);
    config.coordinator.close_timeout = Duration::from_secs(2);
    config.coordinator.max_rollbacks = 2;
    config
}

/// Heartbeat timing tight enough that a missed heartbeat shows within a step
pub fn tight_heartbeats(mut config: RuntimeConfig, timeout: Duration) -> RuntimeConfig {
    config.coordinator.heartbeat_timeout = timeout;
    config.coordinator.heartbeat_interval = timeout / 5;
    config.coordinator.liveness_check_interval = Duration::from_millis(20);
    config
}

pub fn cohort(
    run_id: &str,
    workers: usize,
    backend: Arc<SimulatedBackend>,
    storage: Arc<MemoryStorage>,
) -> anyhow::Result<CohortJob> {
    cohort_with(config(), run_id, workers, backend, storage)
}

pub fn cohort_with(
    config: RuntimeConfig,
    run_id: &str,
    workers: usize,
    backend: Arc<SimulatedBackend>,
    storage: Arc<MemoryStorage>,
) -> anyhow::Result<CohortJob> {
    Ok(CohortJob::new(
        config,
        manifest(run_id, workers),
        training_graph()?,
        backend,
        storage,
    )?)
}

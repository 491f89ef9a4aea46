//! Run a workflow over an in-process cohort
//!
//! Usage: `orchestrator <config.json> <manifest.json> <workflow.json> [epochs]`
//!
//! Exits 0 when every epoch closed and every log replays; otherwise with
//! the exit code of the failure's error class.

use std::process::ExitCode;
use std::sync::Arc;

use orchestrator::{replay_job, telemetry, CohortJob, JobReport};
use resource::SimulatedBackend;
use runtime_core::{Error, Result, RunManifest, RuntimeConfig};
use tracing::{error, info, warn};
use workflow::{GraphLimits, WorkflowSpec};

const DEFAULT_EPOCHS: u64 = 3;

struct Args {
    config: String,
    manifest: String,
    workflow: String,
    epochs: u64,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let usage = || Error::InvalidConfig {
        message: "usage: orchestrator <config.json> <manifest.json> <workflow.json> [epochs]"
            .to_string(),
    };
    let config = args.next().ok_or_else(usage)?;
    let manifest = args.next().ok_or_else(usage)?;
    let workflow = args.next().ok_or_else(usage)?;
    let epochs = match args.next() {
        Some(n) => n.parse().map_err(|_| Error::InvalidConfig {
            message: format!("epochs must be a positive integer, got '{}'", n),
        })?,
        None => DEFAULT_EPOCHS,
    };
    Ok(Args {
        config,
        manifest,
        workflow,
        epochs,
    })
}

async fn run(args: Args) -> Result<JobReport> {
    let config = RuntimeConfig::from_file(&args.config)?;
    let manifest = RunManifest::from_file(&args.manifest)?;
    let graph = WorkflowSpec::from_file(&args.workflow)?.build(GraphLimits::from(&config.builder))?;
    info!(
        run_id = %manifest.run_id,
        workers = manifest.workers.len(),
        nodes = graph.len(),
        fingerprint = graph.fingerprint(),
        "Workflow loaded"
    );

    let backend = Arc::new(SimulatedBackend::new().with_seed(manifest.seed.base_seed));
    let storage = storage::from_config(&config.storage);
    let persist_dir = config.log.persist_dir.clone();
    let job = CohortJob::new(config, manifest, graph, backend, storage)?;

    let report = job.run(args.epochs).await;
    if let Some(dir) = persist_dir {
        if let Err(e) = report.persist_logs(&dir) {
            warn!(dir = %dir, error = %e, "Failed to persist effect logs");
        }
    }

    for replay in replay_job(&job, &report)? {
        if replay.is_consistent() {
            info!(stream = %replay.stream, events = replay.compared, "Replay consistent");
        } else {
            replay.into_result()?;
        }
    }
    Ok(report)
}

fn summary(report: &JobReport) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id,
        "session": report.session.to_string(),
        "target_epoch": report.target_epoch,
        "last_closed": report.last_closed,
        "rollbacks": report.rollbacks,
        "latest_checkpoint": report.latest_checkpoint.as_ref().map(|m| &m.checkpoint),
        "incarnations": report
            .incarnations
            .iter()
            .map(|i| serde_json::json!({
                "worker": i.worker,
                "generation": i.generation,
                "mode": i.mode.to_string(),
                "restored_from": i.restored_from,
            }))
            .collect::<Vec<_>>(),
        "failure": report.failure.as_ref().map(|e| e.code()),
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();

    let outcome = match parse_args() {
        Ok(args) => run(args).await,
        Err(e) => Err(e),
    };
    let failure = match outcome {
        Ok(report) => {
            println!("{:#}", summary(&report));
            report.failure
        }
        Err(e) => Some(e),
    };

    match failure {
        None => ExitCode::SUCCESS,
        Some(err) => {
            error!(code = %err.code(), class = %err.class(), error = %err, "Run failed");
            eprintln!("error: {}", err);
            ExitCode::from(err.class().exit_code() as u8)
        }
    }
}

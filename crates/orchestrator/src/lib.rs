//! In-process orchestration of a worker cohort
//!
//! Ties the runtime crates together:
//! - [`executor`]: one worker incarnation running workflow steps
//! - [`job`]: a cohort driven through epochs, with checkpoint rollback
//! - [`replay`]: re-deriving protocol events from recorded effect logs
//! - [`telemetry`]: tracing setup for binaries
//!
//! # Example
//!
//! ```ignore
//! use orchestrator::{replay_job, CohortJob};
//!
//! let job = CohortJob::new(config, manifest, graph, backend, storage)?;
//! let report = job.run(10).await;
//! for replay in replay_job(&job, &report)? {
//!     assert!(replay.is_consistent(), "{}", replay);
//! }
//! ```

pub mod executor;
pub mod job;
pub mod replay;
pub mod telemetry;

pub use executor::{StepReport, WorkerExecutor};
pub use job::{CohortJob, Incarnation, JobReport};
pub use replay::{replay_coordinator, replay_job, replay_worker, Divergence, ReplayReport};

//! Resource management for one worker
//!
//! - [`ResourceManager`]: handle lifecycle `Allocated -> InFlight -> Allocated -> Freed`
//!   with capacity limits, footprint validation and effect logging
//! - [`ExecutionBackend`]: capability trait for the device backend
//! - [`PendingCompletion`]: the outcome of a submitted node, awaited or polled
//! - [`SimulatedBackend`]: deterministic backend with fault injection

mod arena;
mod backend;
mod handle;
mod manager;
mod sim;

pub use backend::{
    check_release, dispatch, BackendHandle, CompletionToken, ExecutionBackend, Invocation,
    PendingCompletion,
};
pub use handle::{Handle, HandleState};
pub use manager::{AllocRequest, HandleInfo, ResourceManager, Submission};
pub use sim::{ExecutionRecord, Fault, SimulatedBackend};

//! Runtime Core - Foundation for the effect orchestration runtime
//!
//! Provides the shared identifiers, the error taxonomy, configuration,
//! the pinned run manifest and the explicit runtime context that every
//! other crate in the workspace builds on.

pub mod config;
pub mod error;
pub mod manifest;
pub mod runtime;
pub mod types;
pub mod worker;

pub use config::RuntimeConfig;
pub use error::{Error, ErrorClass, Result};
pub use manifest::{BackendRelease, RunManifest};
pub use runtime::{RuntimeContext, RuntimeContextBuilder};
pub use types::*;
pub use worker::{WorkerInfo, WorkerRegistry, WorkerRegistryHandle, WorkerState};

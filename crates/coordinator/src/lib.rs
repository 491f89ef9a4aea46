//! Distributed coordinator for a worker cohort
//!
//! This crate agrees epochs across workers:
//! - **Epochs**: `Forming -> Agreed -> Executing -> Closing -> Closed`, or `Aborted`
//! - **Membership**: every candidate must propose the same membership
//! - **Collectives**: every member issues the same collectives in the same order
//! - **Liveness**: heartbeat timeouts abort the epochs a dead worker is part of
//!
//! # Example
//!
//! ```ignore
//! use coordinator::Coordinator;
//!
//! let coordinator = Coordinator::new(&manifest, config, registry, log);
//! let candidates = coordinator.open_epoch(1)?;
//! coordinator.propose(1, "w0", candidates.clone())?;
//! let group = coordinator.await_agreement(1).await?;
//! ```

pub mod collective;
pub mod epoch;
pub mod service;

pub use collective::{CollectiveGroup, CollectiveSequencer};
pub use epoch::EpochRecord;
pub use service::{Coordinator, CoordinatorHandle};

//! Workflow graphs of typed effects
//!
//! This crate provides:
//! - **Graph building**: a programmatic [`GraphBuilder`] and a declarative
//!   [`WorkflowSpec`] that compile into a finite, acyclic [`WorkflowGraph`]
//!   whose ordering edges are derived from each node's footprint
//! - **Deterministic scheduling**: a [`Scheduler`] that turns the partial
//!   order into one canonical linearization with fixed queue assignment
//!
//! # Example
//!
//! ```rust
//! use runtime_core::config::TopologyConfig;
//! use runtime_core::ResourceClass;
//! use workflow::{GraphBuilder, Scheduler};
//!
//! let mut builder = GraphBuilder::new();
//! builder.handle("weights", ResourceClass::Buffer, 1024);
//! builder.alloc("alloc_weights", "weights");
//! builder.compute("init", &[], &["weights"]);
//! builder.free("free_weights", "weights");
//! let graph = builder.build().unwrap();
//!
//! let schedule = Scheduler::new(TopologyConfig::default(), 0).schedule(&graph).unwrap();
//! assert_eq!(schedule.len(), 3);
//! ```

mod builder;
mod graph;
mod schedule;
mod spec;

pub use builder::{GraphBuilder, GraphLimits};
pub use graph::{EffectNode, ErrorPolicy, Footprint, HandleDecl, WorkflowGraph};
pub use schedule::{QueueAssignment, QueueClass, Schedule, ScheduledNode, Scheduler};
pub use spec::{NodeDecl, Step, WorkflowSpec};

//! Effect log for the orchestration runtime
//!
//! Every resource transition and every coordinator input is appended here
//! before it is treated as done. The log is the source for audits and for
//! replay: a reference interpreter re-derives the protocol events from the
//! same graph and compares them with what was recorded.
//!
//! - [`EffectLog`]: shared append-only log with dense sequence numbers
//! - [`Cursor`]: finite, restartable iteration over a prefix
//! - [`EffectLog::subscribe`]: live tail as a `Stream`

mod entry;
mod log;

pub use entry::{LogEntry, ProtocolEvent, ProtocolInput, Record};
pub use log::{Cursor, EffectLog};

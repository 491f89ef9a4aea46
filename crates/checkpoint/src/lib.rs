//! Checkpoint commit protocol
//!
//! A checkpoint is usable only once its commit marker exists. Workers stage
//! shards and vote through a [`CheckpointParticipant`]; the
//! [`CommitCoordinator`] publishes the marker when every vote succeeded and
//! collects the staged shards otherwise.

mod participant;
mod protocol;
mod record;
mod store;

pub use participant::CheckpointParticipant;
pub use protocol::{checkpoint_id, CommitCoordinator, CommitCoordinatorHandle};
pub use record::{CheckpointRecord, Decision};
pub use store::{CheckpointStore, CommitMarker, StorageCheckpointStore};

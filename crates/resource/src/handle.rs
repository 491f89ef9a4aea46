//! Opaque resource handles

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generation-tagged key for a device-resident resource
///
/// Only a [`ResourceManager`](crate::ResourceManager) creates handles. The
/// generation changes every time a slot is reused, so a stale copy never
/// aliases the slot's next occupant; the owner and incarnation tie the
/// handle to the manager that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    pub(crate) owner: u32,
    pub(crate) incarnation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Rank of the worker that allocated the handle
    pub fn owner(&self) -> u32 {
        self.owner
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}v{}@r{}", self.index, self.generation, self.owner)
    }
}

/// Observable state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Allocated,
    InFlight { readers: u32, writing: bool },
    Freed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleState::Allocated => f.write_str("allocated"),
            HandleState::InFlight { readers, writing } => {
                if *writing {
                    f.write_str("in flight (writing)")
                } else {
                    write!(f, "in flight ({} readers)", readers)
                }
            }
            HandleState::Freed => f.write_str("freed"),
        }
    }
}

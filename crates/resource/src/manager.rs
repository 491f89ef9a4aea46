//! Per-worker resource manager
//!
//! Owns the handle arena and the table of in-flight tokens. Every
//! transition is written to the effect log as an intent entry before the
//! arena changes and an outcome entry after, with the lock held across
//! both so the log order is the bookkeeping order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use effect_log::{EffectLog, ProtocolEvent};
use parking_lot::Mutex;
use runtime_core::{
    EffectKind, Error, ExecutionMode, NodeId, Outcome, ResourceClass, Result, RuntimeContext,
};
use tracing::{debug, info, instrument, warn};

use crate::arena::{Arena, Entry, Miss};
use crate::backend::CompletionToken;
use crate::handle::{Handle, HandleState};

static INCARNATIONS: AtomicU32 = AtomicU32::new(1);

/// Request for a new handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub node: Option<NodeId>,
    pub footprint: u64,
    /// Name recorded in the effect log, usually the workflow's handle name
    pub label: String,
    pub class: ResourceClass,
    pub size_bytes: u64,
}

/// A node ready to be handed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub node: NodeId,
    pub kind: EffectKind,
    pub footprint: u64,
    pub reads: Vec<Handle>,
    pub writes: Vec<Handle>,
}

#[derive(Debug)]
struct InFlight {
    reads: Vec<Handle>,
    writes: Vec<Handle>,
}

#[derive(Debug, Default)]
struct State {
    arena: Arena,
    tokens: HashMap<u64, InFlight>,
    next_token: u64,
}

/// Read-only description of a live handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    pub handle: Handle,
    pub label: String,
    pub class: ResourceClass,
    pub size_bytes: u64,
    pub state: HandleState,
}

/// Resource manager for one worker
pub struct ResourceManager {
    ctx: RuntimeContext,
    log: EffectLog,
    incarnation: u32,
    state: Mutex<State>,
}

impl ResourceManager {
    pub fn new(ctx: RuntimeContext, log: EffectLog) -> Self {
        Self {
            ctx,
            log,
            incarnation: INCARNATIONS.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::default()),
        }
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn log(&self) -> &EffectLog {
        &self.log
    }

    fn handle_for(&self, index: u32, generation: u32) -> Handle {
        Handle {
            index,
            generation,
            owner: self.ctx.rank(),
            incarnation: self.incarnation,
        }
    }

    fn check_owner(&self, handle: &Handle) -> Result<()> {
        if handle.owner != self.ctx.rank() || handle.incarnation != self.incarnation {
            return Err(Error::ForeignHandle {
                handle: handle.to_string(),
                owner: format!("rank {}", handle.owner),
                worker: self.ctx.worker_id().to_string(),
            });
        }
        Ok(())
    }

    fn miss_error(handle: &Handle, miss: Miss) -> Error {
        let state = match miss {
            Miss::Stale => "freed",
            Miss::NeverIssued => "never issued",
        };
        Error::UseAfterFreeOrDoubleFree {
            handle: handle.to_string(),
            state: state.to_string(),
        }
    }

    /// Allocate a new handle
    #[instrument(skip(self, request), fields(worker_id = %self.ctx.worker_id(), label = %request.label))]
    pub fn alloc(&self, request: AllocRequest) -> Result<Handle> {
        self.ctx.ensure_permits(EffectKind::Alloc, "alloc")?;
        let capacity = &self.ctx.config().resource;

        let mut state = self.state.lock();
        self.log
            .intent(request.node, EffectKind::Alloc, request.footprint);

        let available = capacity.capacity_bytes.saturating_sub(state.arena.bytes());
        if request.size_bytes > available || state.arena.live() >= capacity.max_handles {
            let err = Error::ResourceExhausted {
                requested: request.size_bytes,
                available,
                live_handles: state.arena.live(),
            };
            self.log.outcome(
                request.node,
                EffectKind::Alloc,
                Outcome::failed(err.to_string()),
            );
            return Err(err);
        }

        let (index, generation) = state.arena.insert(Entry {
            label: request.label.clone(),
            class: request.class,
            size_bytes: request.size_bytes,
            serial: 0,
            readers: 0,
            writing: false,
        });
        let handle = self.handle_for(index, generation);

        self.log
            .outcome(request.node, EffectKind::Alloc, Outcome::Succeeded);
        self.log.event(
            request.node,
            ProtocolEvent::Allocated {
                handle: request.label,
            },
        );
        debug!(%handle, bytes_in_use = state.arena.bytes(), "Handle allocated");
        Ok(handle)
    }

    /// Free a handle that is allocated and not in flight
    #[instrument(skip(self), fields(worker_id = %self.ctx.worker_id()))]
    pub fn free(&self, node: Option<NodeId>, footprint: u64, handle: &Handle) -> Result<()> {
        self.ctx.ensure_permits(EffectKind::Free, "free")?;
        self.check_owner(handle)?;

        let mut state = self.state.lock();
        self.log.intent(node, EffectKind::Free, footprint);
        self.free_locked(&mut state, node, handle)
    }

    fn free_locked(&self, state: &mut State, node: Option<NodeId>, handle: &Handle) -> Result<()> {
        let check = match state.arena.get(handle.index, handle.generation) {
            Ok(entry) => match entry.state() {
                HandleState::Allocated => Ok(()),
                other => Err(Error::UseAfterFreeOrDoubleFree {
                    handle: handle.to_string(),
                    state: other.to_string(),
                }),
            },
            Err(miss) => Err(Self::miss_error(handle, miss)),
        };
        if let Err(err) = check {
            self.log
                .outcome(node, EffectKind::Free, Outcome::failed(err.to_string()));
            return Err(err);
        }

        let entry = state
            .arena
            .remove(handle.index, handle.generation)
            .map_err(|miss| Self::miss_error(handle, miss))?;
        self.log.outcome(node, EffectKind::Free, Outcome::Succeeded);
        self.log
            .event(node, ProtocolEvent::Freed { handle: entry.label });
        debug!(%handle, "Handle freed");
        Ok(())
    }

    /// Mark the submission's handles in flight and issue a token
    #[instrument(skip(self, submission), fields(worker_id = %self.ctx.worker_id(), node = %submission.node))]
    pub fn submit(&self, submission: Submission) -> Result<CompletionToken> {
        self.ctx
            .ensure_permits(submission.kind, submission.kind.as_str())?;
        for handle in submission.reads.iter().chain(&submission.writes) {
            self.check_owner(handle)?;
        }

        let mut state = self.state.lock();
        self.validate_footprint(&state, &submission)?;

        self.log.intent(
            Some(submission.node),
            submission.kind,
            submission.footprint,
        );
        for handle in &submission.reads {
            if let Ok(entry) = state.arena.get_mut(handle.index, handle.generation) {
                entry.readers += 1;
            }
        }
        for handle in &submission.writes {
            if let Ok(entry) = state.arena.get_mut(handle.index, handle.generation) {
                entry.writing = true;
            }
        }

        let id = state.next_token;
        state.next_token += 1;
        state.tokens.insert(
            id,
            InFlight {
                reads: submission.reads,
                writes: submission.writes,
            },
        );
        debug!(token = id, in_flight = state.tokens.len(), "Node submitted");

        Ok(CompletionToken {
            id,
            node: submission.node,
            kind: submission.kind,
        })
    }

    fn validate_footprint(&self, state: &State, submission: &Submission) -> Result<()> {
        let invalid = |handle: &Handle, reason: String| Error::InvalidFootprint {
            node: submission.node,
            handle: handle.to_string(),
            reason,
        };

        for handle in &submission.writes {
            let entry = state
                .arena
                .get(handle.index, handle.generation)
                .map_err(|_| invalid(handle, "is not allocated".to_string()))?;
            if entry.state() != HandleState::Allocated {
                return Err(invalid(
                    handle,
                    format!("cannot be written while {}", entry.state()),
                ));
            }
            if submission.reads.contains(handle) {
                return Err(invalid(handle, "is both read and written".to_string()));
            }
        }
        for handle in &submission.reads {
            let entry = state
                .arena
                .get(handle.index, handle.generation)
                .map_err(|_| invalid(handle, "is not allocated".to_string()))?;
            if entry.writing {
                return Err(invalid(handle, "is being written".to_string()));
            }
        }
        Ok(())
    }

    /// Report the outcome of a submitted node
    ///
    /// A failed outcome switches the runtime to cleanup mode.
    #[instrument(skip(self, token), fields(worker_id = %self.ctx.worker_id(), node = %token.node))]
    pub fn complete(&self, token: &CompletionToken, outcome: Outcome) -> Result<()> {
        let mut state = self.state.lock();
        let Some(in_flight) = state.tokens.remove(&token.id) else {
            return Err(Error::assumption(
                "backend.single-completion",
                format!("token {} for {} completed twice", token.id, token.node),
            ));
        };

        self.log
            .outcome(Some(token.node), token.kind, outcome.clone());
        for handle in &in_flight.reads {
            if let Ok(entry) = state.arena.get_mut(handle.index, handle.generation) {
                entry.readers = entry.readers.saturating_sub(1);
            }
        }
        for handle in &in_flight.writes {
            if let Ok(entry) = state.arena.get_mut(handle.index, handle.generation) {
                entry.writing = false;
            }
        }

        if let Outcome::Failed { reason } = &outcome {
            warn!(reason = %reason, "Node failed");
            let reason = format!("{} failed: {}", token.node, reason);
            self.enter_cleanup_locked(Some(reason));
        }
        Ok(())
    }

    fn enter_cleanup_locked(&self, reason: Option<String>) -> bool {
        let changed = self.ctx.enter_cleanup(reason);
        if changed {
            self.log.event(
                None,
                ProtocolEvent::ModeChanged {
                    from: ExecutionMode::Running,
                    to: ExecutionMode::Cleanup,
                },
            );
        }
        changed
    }

    /// Switch to cleanup mode, recording `reason` as a failure if given
    pub fn begin_cleanup(&self, reason: Option<String>) -> bool {
        let _state = self.state.lock();
        self.enter_cleanup_locked(reason)
    }

    /// Free every remaining handle, oldest allocation first
    ///
    /// Refuses while nodes are still in flight; drain them first.
    pub fn release_all(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        if !state.tokens.is_empty() {
            return Err(Error::Internal {
                message: format!(
                    "cannot release handles with {} nodes in flight",
                    state.tokens.len()
                ),
            });
        }

        let live: Vec<(Handle, String)> = state
            .arena
            .live_entries()
            .into_iter()
            .map(|(index, generation, entry)| {
                (self.handle_for(index, generation), entry.label.clone())
            })
            .collect();

        let mut released = Vec::with_capacity(live.len());
        for (handle, label) in live {
            self.log.intent(None, EffectKind::Free, 0);
            self.free_locked(&mut state, None, &handle)?;
            released.push(label);
        }
        if !released.is_empty() {
            info!(
                worker_id = %self.ctx.worker_id(),
                released = released.len(),
                "Released remaining handles"
            );
        }
        Ok(released)
    }

    /// Leave cleanup mode once everything is drained and released
    pub fn finish(&self) -> Result<ExecutionMode> {
        let state = self.state.lock();
        if !state.tokens.is_empty() || state.arena.live() > 0 {
            return Err(Error::Internal {
                message: format!(
                    "cannot finish with {} nodes in flight and {} live handles",
                    state.tokens.len(),
                    state.arena.live()
                ),
            });
        }

        let next = if self.ctx.has_failed() {
            ExecutionMode::Failed
        } else {
            ExecutionMode::Done
        };
        let from = self.ctx.transition(next)?;
        self.log
            .event(None, ProtocolEvent::ModeChanged { from, to: next });
        Ok(next)
    }

    pub fn state_of(&self, handle: &Handle) -> Result<HandleState> {
        self.check_owner(handle)?;
        let state = self.state.lock();
        match state.arena.get(handle.index, handle.generation) {
            Ok(entry) => Ok(entry.state()),
            Err(Miss::Stale) => Ok(HandleState::Freed),
            Err(miss) => Err(Self::miss_error(handle, miss)),
        }
    }

    /// Live handles, oldest allocation first
    pub fn live_handles(&self) -> Vec<HandleInfo> {
        let state = self.state.lock();
        state
            .arena
            .live_entries()
            .into_iter()
            .map(|(index, generation, entry)| HandleInfo {
                handle: self.handle_for(index, generation),
                label: entry.label.clone(),
                class: entry.class,
                size_bytes: entry.size_bytes,
                state: entry.state(),
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().tokens.len()
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.state.lock().arena.bytes()
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResourceManager")
            .field("worker_id", &self.ctx.worker_id())
            .field("live", &state.arena.live())
            .field("in_flight", &state.tokens.len())
            .finish()
    }
}

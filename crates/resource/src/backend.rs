//! Execution backend capability and pending completions
//!
//! A backend executes copy, compute, collective and checkpoint effects on
//! device. It must report exactly one truthful outcome per invocation and
//! touch only the handles it was given.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{BackendRelease, EffectKind, Epoch, Error, NodeId, Outcome, Result, WorkerId};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::handle::Handle;

/// One request to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub worker: WorkerId,
    pub epoch: Epoch,
    pub node: NodeId,
    pub name: String,
    pub kind: EffectKind,
    pub reads: Vec<Handle>,
    pub writes: Vec<Handle>,
    /// Seed derived from the manifest for this worker and epoch
    pub seed: u64,
    /// 1-based attempt number
    pub attempt: u32,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Release identifier the run manifest pins
    fn release(&self) -> &BackendRelease;

    /// Run one effect and report its outcome
    async fn execute(&self, invocation: &Invocation) -> Outcome;

    /// Serialized contents of the handles a checkpoint node reads
    async fn snapshot(&self, invocation: &Invocation) -> Result<Bytes>;

    /// Load a shard taken by [`ExecutionBackend::snapshot`] back into
    /// `worker`'s device state before it runs another step
    async fn restore(&self, worker: &str, data: Bytes) -> Result<()>;
}

pub type BackendHandle = Arc<dyn ExecutionBackend>;

/// Proof that a node was submitted and is waiting for its outcome
///
/// Cloning is allowed so a misbehaving backend path can be detected: the
/// manager accepts one completion per token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionToken {
    pub(crate) id: u64,
    pub(crate) node: NodeId,
    pub(crate) kind: EffectKind,
}

impl CompletionToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn kind(&self) -> EffectKind {
        self.kind
    }
}

/// Outcome that will be available once the backend finishes
#[derive(Debug)]
pub struct PendingCompletion {
    token: CompletionToken,
    receiver: oneshot::Receiver<Outcome>,
    ready: Option<Outcome>,
}

impl PendingCompletion {
    /// A completion whose outcome is already known
    pub fn ready(token: CompletionToken, outcome: Outcome) -> Self {
        let (_, receiver) = oneshot::channel();
        Self {
            token,
            receiver,
            ready: Some(outcome),
        }
    }

    /// A completion resolved by whoever holds the returned sender
    pub fn channel(token: CompletionToken) -> (oneshot::Sender<Outcome>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            Self {
                token,
                receiver,
                ready: None,
            },
        )
    }

    pub fn token(&self) -> &CompletionToken {
        &self.token
    }

    /// Non-blocking check
    pub fn poll(&mut self) -> Option<&Outcome> {
        if self.ready.is_none() {
            match self.receiver.try_recv() {
                Ok(outcome) => self.ready = Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.ready = Some(Outcome::failed("backend dropped the completion"))
                }
            }
        }
        self.ready.as_ref()
    }

    /// Wait for the outcome
    ///
    /// A dropped sender counts as a failed outcome: the backend can no
    /// longer report truthfully for this node.
    pub async fn wait(self) -> (CompletionToken, Outcome) {
        if let Some(outcome) = self.ready {
            return (self.token, outcome);
        }
        let outcome = self
            .receiver
            .await
            .unwrap_or_else(|_| Outcome::failed("backend dropped the completion"));
        (self.token, outcome)
    }
}

/// Run `invocation` on `backend` in a task, retrying failed attempts up to
/// `attempts` times in total
pub fn dispatch(
    backend: BackendHandle,
    token: CompletionToken,
    mut invocation: Invocation,
    attempts: u32,
) -> PendingCompletion {
    let (sender, pending) = PendingCompletion::channel(token);
    let attempts = attempts.max(1);

    tokio::spawn(async move {
        let mut outcome = Outcome::failed("not executed");
        for attempt in 1..=attempts {
            invocation.attempt = attempt;
            outcome = backend.execute(&invocation).await;
            match &outcome {
                Outcome::Succeeded => break,
                Outcome::Failed { reason } if attempt < attempts => {
                    warn!(
                        node = %invocation.node,
                        name = %invocation.name,
                        attempt,
                        reason = %reason,
                        "Retrying idempotent node"
                    );
                }
                Outcome::Failed { .. } => {}
            }
        }
        debug!(node = %invocation.node, success = outcome.is_success(), "Backend completed");
        // The executor may have given up on this node already
        let _ = sender.send(outcome);
    });

    pending
}

/// Refuse to start against a backend the manifest does not pin
pub fn check_release(backend: &dyn ExecutionBackend, pinned: &BackendRelease) -> Result<()> {
    let actual = backend.release();
    if actual != pinned {
        return Err(Error::ManifestMismatch {
            field: "backend".to_string(),
            expected: pinned.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

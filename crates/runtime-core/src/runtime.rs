//! Explicit runtime context
//!
//! Each worker owns one `RuntimeContext`. It carries the execution mode,
//! the configuration and the pinned manifest, and is passed to every
//! component that needs them instead of living in global state, so tests
//! can run several independent runtimes side by side.

use crate::types::{EffectKind, ExecutionMode, WorkerId};
use crate::{Error, Result, RunManifest, RuntimeConfig};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Shutdown signal sender
pub type ShutdownSender = broadcast::Sender<()>;

/// Shutdown signal receiver
pub type ShutdownReceiver = broadcast::Receiver<()>;

struct ModeCell {
    mode: ExecutionMode,
    reason: Option<String>,
}

struct Inner {
    worker_id: WorkerId,
    config: RuntimeConfig,
    manifest: RunManifest,
    mode: RwLock<ModeCell>,
    mode_tx: watch::Sender<ExecutionMode>,
    shutdown_tx: ShutdownSender,
}

/// Cheaply cloneable runtime context for one worker
#[derive(Clone)]
pub struct RuntimeContext {
    inner: Arc<Inner>,
}

impl RuntimeContext {
    /// Create a context in `Running` mode
    pub fn new(worker_id: WorkerId, config: RuntimeConfig, manifest: RunManifest) -> Result<Self> {
        config.validate()?;
        manifest.validate()?;
        if manifest.rank_of(&worker_id).is_none() {
            return Err(Error::InvalidConfig {
                message: format!("worker '{}' is not listed in the run manifest", worker_id),
            });
        }

        let (mode_tx, _) = watch::channel(ExecutionMode::Running);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(Inner {
                worker_id,
                config,
                manifest,
                mode: RwLock::new(ModeCell {
                    mode: ExecutionMode::Running,
                    reason: None,
                }),
                mode_tx,
                shutdown_tx,
            }),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Rank of this worker in the manifest ordering
    pub fn rank(&self) -> u32 {
        self.inner
            .manifest
            .rank_of(&self.inner.worker_id)
            .unwrap_or_default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.inner.manifest
    }

    /// Current execution mode
    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode.read().mode
    }

    /// Reason recorded with the first move out of `Running`
    pub fn failure_reason(&self) -> Option<String> {
        self.inner.mode.read().reason.clone()
    }

    /// Watch mode changes
    pub fn mode_receiver(&self) -> watch::Receiver<ExecutionMode> {
        self.inner.mode_tx.subscribe()
    }

    /// Move to `next`, rejecting non-monotone transitions
    pub fn transition(&self, next: ExecutionMode) -> Result<ExecutionMode> {
        let mut cell = self.inner.mode.write();
        let previous = cell.mode;
        if !previous.can_transition_to(next) {
            return Err(Error::Internal {
                message: format!("execution mode cannot move from {} to {}", previous, next),
            });
        }
        cell.mode = next;
        drop(cell);

        info!(
            worker_id = %self.inner.worker_id,
            from = %previous,
            to = %next,
            "Execution mode changed"
        );
        let _ = self.inner.mode_tx.send(next);
        Ok(previous)
    }

    /// Enter cleanup mode. Returns true if this call made the transition.
    pub fn enter_cleanup(&self, reason: Option<String>) -> bool {
        let mut cell = self.inner.mode.write();
        if cell.mode != ExecutionMode::Running {
            return false;
        }
        cell.mode = ExecutionMode::Cleanup;
        if let Some(reason) = &reason {
            warn!(worker_id = %self.inner.worker_id, reason = %reason, "Entering cleanup mode");
            cell.reason = Some(reason.clone());
        } else {
            info!(worker_id = %self.inner.worker_id, "Entering cleanup mode");
        }
        drop(cell);

        let _ = self.inner.mode_tx.send(ExecutionMode::Cleanup);
        true
    }

    /// Whether any failure has been recorded
    pub fn has_failed(&self) -> bool {
        self.inner.mode.read().reason.is_some()
    }

    /// Refuse `operation` for an effect of `kind` unless the mode permits it
    pub fn ensure_permits(&self, kind: EffectKind, operation: &str) -> Result<()> {
        let mode = self.mode();
        if mode.permits(kind) {
            Ok(())
        } else {
            Err(Error::ExecutionHalted {
                mode,
                operation: operation.to_string(),
            })
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> ShutdownReceiver {
        self.inner.shutdown_tx.subscribe()
    }

    /// Signal shutdown to all components
    pub fn shutdown(&self) {
        info!(worker_id = %self.inner.worker_id, "Initiating runtime shutdown");
        let _ = self.inner.shutdown_tx.send(());
    }
}

/// Builder for RuntimeContext
pub struct RuntimeContextBuilder {
    worker_id: WorkerId,
    config: RuntimeConfig,
    manifest: RunManifest,
}

impl RuntimeContextBuilder {
    /// Create a builder with default config
    pub fn new(worker_id: impl Into<WorkerId>, manifest: RunManifest) -> Self {
        Self {
            worker_id: worker_id.into(),
            config: RuntimeConfig::default(),
            manifest,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the resource capacity in bytes
    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.config.resource.capacity_bytes = bytes;
        self
    }

    /// Set the live handle limit
    pub fn max_handles(mut self, max: usize) -> Self {
        self.config.resource.max_handles = max;
        self
    }

    /// Build the context
    pub fn build(self) -> Result<RuntimeContext> {
        RuntimeContext::new(self.worker_id, self.config, self.manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendRelease;

    fn manifest() -> RunManifest {
        RunManifest::new(
            "run-ctx",
            BackendRelease::new("sim", "1"),
            vec!["w0".to_string(), "w1".to_string()],
            7,
        )
    }

    #[test]
    fn test_context_creation() {
        let ctx = RuntimeContextBuilder::new("w1", manifest())
            .max_handles(8)
            .build()
            .unwrap();

        assert_eq!(ctx.rank(), 1);
        assert_eq!(ctx.mode(), ExecutionMode::Running);
        assert_eq!(ctx.config().resource.max_handles, 8);
    }

    #[test]
    fn test_unknown_worker_rejected() {
        let result = RuntimeContextBuilder::new("w9", manifest()).build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_cleanup_is_entered_once() {
        let ctx = RuntimeContextBuilder::new("w0", manifest()).build().unwrap();

        assert!(ctx.enter_cleanup(Some("kernel fault".to_string())));
        assert!(!ctx.enter_cleanup(Some("second fault".to_string())));
        assert_eq!(ctx.mode(), ExecutionMode::Cleanup);
        assert_eq!(ctx.failure_reason().as_deref(), Some("kernel fault"));

        assert!(ctx.ensure_permits(EffectKind::Free, "free").is_ok());
        assert!(matches!(
            ctx.ensure_permits(EffectKind::Compute, "submit"),
            Err(Error::ExecutionHalted { .. })
        ));
    }

    #[test]
    fn test_independent_contexts() {
        let a = RuntimeContextBuilder::new("w0", manifest()).build().unwrap();
        let b = RuntimeContextBuilder::new("w0", manifest()).build().unwrap();

        a.enter_cleanup(None);
        assert_eq!(a.mode(), ExecutionMode::Cleanup);
        assert_eq!(b.mode(), ExecutionMode::Running);
    }

    #[test]
    fn test_terminal_transitions() {
        let ctx = RuntimeContextBuilder::new("w0", manifest()).build().unwrap();
        assert!(ctx.transition(ExecutionMode::Done).is_err());

        ctx.enter_cleanup(None);
        ctx.transition(ExecutionMode::Done).unwrap();
        assert!(ctx.transition(ExecutionMode::Failed).is_err());
        assert!(!ctx.enter_cleanup(None));
    }
}

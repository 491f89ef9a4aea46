//! Simulated execution backend
//!
//! Executes nothing on device. Latency is drawn deterministically from the
//! seed and the invocation, so completion order varies between nodes but
//! not between runs. Failures are injected per node name.
//!
//! Device state is modelled per worker as the last snapshot or restored
//! shard. Each snapshot names the digest of the state it was taken from,
//! so a restored worker's next checkpoint shows where it resumed.

use std::collections::HashMap;
use std::hash::Hasher;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHasher;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use runtime_core::{BackendRelease, EffectKind, Epoch, NodeId, Outcome, Result, WorkerId};
use tracing::debug;

use crate::backend::{ExecutionBackend, Invocation};

/// Injected failure for nodes with a given name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub node: String,
    pub worker: Option<WorkerId>,
    pub epoch: Option<Epoch>,
    /// Number of attempts affected; `None` affects every attempt
    pub failures: Option<u32>,
    /// Hold the attempt this long and then succeed instead of failing
    pub stall: Option<Duration>,
}

impl Fault {
    pub fn always(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            worker: None,
            epoch: None,
            failures: None,
            stall: None,
        }
    }

    /// Delay the next attempt of `node` by `duration`, e.g. a hung device
    pub fn stall(node: impl Into<String>, duration: Duration) -> Self {
        Self {
            failures: Some(1),
            stall: Some(duration),
            ..Self::always(node)
        }
    }

    pub fn times(node: impl Into<String>, failures: u32) -> Self {
        Self {
            failures: Some(failures),
            ..Self::always(node)
        }
    }

    pub fn on_worker(mut self, worker: impl Into<WorkerId>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn in_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    fn matches(&self, invocation: &Invocation) -> bool {
        self.node == invocation.name
            && self.worker.as_ref().map_or(true, |w| *w == invocation.worker)
            && self.epoch.map_or(true, |e| e == invocation.epoch)
    }
}

/// What the simulated backend was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub worker: WorkerId,
    pub epoch: Epoch,
    pub node: NodeId,
    pub kind: EffectKind,
    pub attempt: u32,
    pub succeeded: bool,
}

/// Backend that simulates latency and failures
#[derive(Debug)]
pub struct SimulatedBackend {
    release: BackendRelease,
    seed: u64,
    base_latency: Duration,
    jitter: Duration,
    faults: Mutex<Vec<Fault>>,
    executed: Mutex<Vec<ExecutionRecord>>,
    state: Mutex<HashMap<WorkerId, Bytes>>,
    restored: Mutex<Vec<(WorkerId, Bytes)>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            release: Self::default_release(),
            seed: 0,
            base_latency: Duration::ZERO,
            jitter: Duration::ZERO,
            faults: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            state: Mutex::new(HashMap::new()),
            restored: Mutex::new(Vec::new()),
        }
    }

    /// Release identifier reported by default
    pub fn default_release() -> BackendRelease {
        BackendRelease::new("simulated", env!("CARGO_PKG_VERSION"))
    }

    pub fn with_release(mut self, release: BackendRelease) -> Self {
        self.release = release;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_latency(mut self, base: Duration, jitter: Duration) -> Self {
        self.base_latency = base;
        self.jitter = jitter;
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Every attempt executed so far, in completion order
    pub fn executed(&self) -> Vec<ExecutionRecord> {
        self.executed.lock().clone()
    }

    /// Current device state of `worker`
    pub fn state_of(&self, worker: &str) -> Option<Bytes> {
        self.state.lock().get(worker).cloned()
    }

    /// Every shard handed to [`ExecutionBackend::restore`], in call order
    pub fn restored(&self) -> Vec<(WorkerId, Bytes)> {
        self.restored.lock().clone()
    }

    fn latency(&self, invocation: &Invocation) -> Duration {
        if self.jitter.is_zero() {
            return self.base_latency;
        }
        let mut hasher = FnvHasher::with_key(self.seed);
        hasher.write(invocation.worker.as_bytes());
        hasher.write_u64(invocation.epoch);
        hasher.write_u32(invocation.node.0);
        hasher.write_u64(invocation.seed);
        hasher.write_u32(invocation.attempt);
        let mut rng = ChaCha8Rng::seed_from_u64(hasher.finish());
        let jitter_us = self.jitter.as_micros() as u64;
        self.base_latency + Duration::from_micros(rng.gen_range(0..=jitter_us))
    }

    /// Consume one matching fault, if any
    fn take_fault(&self, invocation: &Invocation) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let fault = faults.iter_mut().find(|f| {
            f.matches(invocation) && f.failures.map_or(true, |remaining| remaining > 0)
        })?;
        if let Some(remaining) = fault.failures.as_mut() {
            *remaining -= 1;
        }
        Some(fault.clone())
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    fn release(&self) -> &BackendRelease {
        &self.release
    }

    async fn execute(&self, invocation: &Invocation) -> Outcome {
        let latency = self.latency(invocation);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let outcome = match self.take_fault(invocation) {
            Some(Fault {
                stall: Some(stall), ..
            }) => {
                debug!(
                    worker_id = %invocation.worker,
                    node = %invocation.node,
                    stall_ms = stall.as_millis() as u64,
                    "Stalling"
                );
                tokio::time::sleep(stall).await;
                Outcome::Succeeded
            }
            Some(_) => Outcome::failed(format!(
                "injected fault in {} on {}",
                invocation.name, invocation.worker
            )),
            None => Outcome::Succeeded,
        };
        debug!(
            worker_id = %invocation.worker,
            node = %invocation.node,
            attempt = invocation.attempt,
            success = outcome.is_success(),
            "Simulated execution"
        );

        self.executed.lock().push(ExecutionRecord {
            worker: invocation.worker.clone(),
            epoch: invocation.epoch,
            node: invocation.node,
            kind: invocation.kind,
            attempt: invocation.attempt,
            succeeded: outcome.is_success(),
        });
        outcome
    }

    async fn snapshot(&self, invocation: &Invocation) -> Result<Bytes> {
        let handles: Vec<String> = invocation.reads.iter().map(|h| h.to_string()).collect();
        let mut state = self.state.lock();
        let base = match state.get(&invocation.worker) {
            Some(previous) => {
                let mut hasher = FnvHasher::default();
                hasher.write(previous);
                format!("{:016x}", hasher.finish())
            }
            None => "-".to_string(),
        };
        let data = Bytes::from(format!(
            "{}|{}|{}|{}|{}",
            invocation.worker,
            invocation.epoch,
            invocation.name,
            handles.join(","),
            base
        ));
        state.insert(invocation.worker.clone(), data.clone());
        Ok(data)
    }

    async fn restore(&self, worker: &str, data: Bytes) -> Result<()> {
        debug!(worker_id = %worker, size_bytes = data.len(), "Simulated restore");
        self.state.lock().insert(worker.to_string(), data.clone());
        self.restored.lock().push((worker.to_string(), data));
        Ok(())
    }
}

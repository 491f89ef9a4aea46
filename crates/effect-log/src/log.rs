//! Append-only log with cursors, live tail and persistence

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use runtime_core::{EffectKind, Error, NodeId, Outcome, Result, Seq};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace};

use crate::entry::{LogEntry, ProtocolEvent, ProtocolInput, Record};

const DEFAULT_TAIL_CAPACITY: usize = 1024;

struct Inner {
    name: String,
    entries: RwLock<Vec<LogEntry>>,
    tail: broadcast::Sender<LogEntry>,
}

/// Shared, append-only effect log
///
/// Cloning gives another handle to the same log. Sequence numbers are
/// dense and start at zero.
#[derive(Clone)]
pub struct EffectLog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EffectLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectLog")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedLog {
    name: String,
    entries: Vec<LogEntry>,
}

impl EffectLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_tail_capacity(name, DEFAULT_TAIL_CAPACITY)
    }

    pub fn with_tail_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self::from_entries(name.into(), Vec::new(), capacity)
    }

    fn from_entries(name: String, entries: Vec<LogEntry>, capacity: usize) -> Self {
        let (tail, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                name,
                entries: RwLock::new(entries),
                tail,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append a record and return its sequence number
    pub fn append(&self, node: Option<NodeId>, record: Record) -> Seq {
        let entry = {
            let mut entries = self.inner.entries.write();
            let entry = LogEntry {
                seq: entries.len() as Seq,
                node,
                record,
            };
            entries.push(entry.clone());
            entry
        };
        trace!(log = %self.inner.name, seq = entry.seq, "Appended log entry");
        let seq = entry.seq;
        // No subscribers is fine
        let _ = self.inner.tail.send(entry);
        seq
    }

    pub fn intent(&self, node: Option<NodeId>, kind: EffectKind, footprint: u64) -> Seq {
        self.append(node, Record::Intent { kind, footprint })
    }

    pub fn outcome(&self, node: Option<NodeId>, kind: EffectKind, outcome: Outcome) -> Seq {
        self.append(node, Record::Outcome { kind, outcome })
    }

    pub fn input(&self, input: ProtocolInput) -> Seq {
        self.append(None, Record::Input(input))
    }

    pub fn event(&self, node: Option<NodeId>, event: ProtocolEvent) -> Seq {
        self.append(node, Record::Event(event))
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    pub fn get(&self, seq: Seq) -> Option<LogEntry> {
        self.inner.entries.read().get(seq as usize).cloned()
    }

    /// Copy of every entry appended so far
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.inner.entries.read().clone()
    }

    /// Protocol events in log order
    pub fn events(&self) -> Vec<(Option<NodeId>, ProtocolEvent)> {
        self.inner
            .entries
            .read()
            .iter()
            .filter_map(|e| e.event().map(|ev| (e.node, ev.clone())))
            .collect()
    }

    /// Protocol inputs in log order
    pub fn inputs(&self) -> Vec<ProtocolInput> {
        self.inner
            .entries
            .read()
            .iter()
            .filter_map(|e| e.input().cloned())
            .collect()
    }

    /// Cursor over the entries present now
    pub fn cursor(&self) -> Cursor {
        self.cursor_from(0)
    }

    /// Cursor starting at `seq`, bounded by the current length
    pub fn cursor_from(&self, seq: Seq) -> Cursor {
        let end = self.len() as Seq;
        let start = seq.min(end);
        Cursor {
            log: self.clone(),
            start,
            position: start,
            end,
        }
    }

    /// Stream of entries appended from now on
    ///
    /// A subscriber that falls more than the tail capacity behind skips
    /// the entries it missed; use a cursor to fill the gap.
    pub fn subscribe(&self) -> impl Stream<Item = LogEntry> + Send + 'static {
        BroadcastStream::new(self.inner.tail.subscribe()).filter_map(|entry| entry.ok())
    }

    /// Write the log to `path` with bincode
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let persisted = PersistedLog {
            name: self.inner.name.clone(),
            entries: self.snapshot(),
        };
        let bytes =
            bincode::serialize(&persisted).map_err(|e| Error::Serialization(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = path.with_extension("tmp");
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, path)?;

        debug!(
            log = %self.inner.name,
            entries = persisted.entries.len(),
            path = %path.display(),
            "Effect log persisted"
        );
        Ok(())
    }

    /// Load a log written by [`EffectLog::persist`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let persisted: PersistedLog =
            bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;

        for (index, entry) in persisted.entries.iter().enumerate() {
            if entry.seq != index as Seq {
                return Err(Error::Serialization(format!(
                    "log '{}' has entry {} at position {}",
                    persisted.name, entry.seq, index
                )));
            }
        }
        Ok(Self::from_entries(
            persisted.name,
            persisted.entries,
            DEFAULT_TAIL_CAPACITY,
        ))
    }
}

/// Finite, restartable iterator over a prefix of a log
#[derive(Debug, Clone)]
pub struct Cursor {
    log: EffectLog,
    start: Seq,
    position: Seq,
    end: Seq,
}

impl Cursor {
    /// Go back to where the cursor started
    pub fn rewind(&mut self) {
        self.position = self.start;
    }

    pub fn position(&self) -> Seq {
        self.position
    }

    pub fn remaining(&self) -> usize {
        (self.end - self.position) as usize
    }
}

impl Iterator for Cursor {
    type Item = LogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let entry = self.log.get(self.position)?;
        self.position += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

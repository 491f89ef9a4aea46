//! Immutable workflow graph produced by the builder

use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;

use fnv::FnvHasher;
use runtime_core::{CollectiveMode, EffectKind, NodeId, ResourceClass};
use serde::{Deserialize, Serialize};

/// A symbolic handle declared by a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleDecl {
    pub name: String,
    pub class: ResourceClass,
    #[serde(default)]
    pub size_bytes: u64,
}

impl HandleDecl {
    pub fn new(name: impl Into<String>, class: ResourceClass, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            class,
            size_bytes,
        }
    }
}

/// What to do when the backend reports a failed outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Enter cleanup on the first failure
    #[default]
    FailFast,

    /// Resubmit an idempotent node up to `max_attempts` times before failing
    RetryIdempotent { max_attempts: u32 },
}

impl ErrorPolicy {
    /// Total attempts allowed, including the first one
    pub fn attempts(&self) -> u32 {
        match self {
            ErrorPolicy::FailFast => 1,
            ErrorPolicy::RetryIdempotent { max_attempts } => (*max_attempts).max(1),
        }
    }
}

/// Read and write sets of one node, by symbolic handle name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    reads: BTreeSet<String>,
    writes: BTreeSet<String>,
}

impl Footprint {
    pub fn new<R, W>(reads: R, writes: W) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let writes: BTreeSet<String> = writes.into_iter().map(Into::into).collect();
        // A handle that is written is not also listed as a read
        let reads = reads
            .into_iter()
            .map(Into::into)
            .filter(|r| !writes.contains(r))
            .collect();
        Self { reads, writes }
    }

    pub fn reads(&self) -> impl Iterator<Item = &str> {
        self.reads.iter().map(String::as_str)
    }

    pub fn writes(&self) -> impl Iterator<Item = &str> {
        self.writes.iter().map(String::as_str)
    }

    /// Every handle touched, in name order
    pub fn handles(&self) -> impl Iterator<Item = &str> {
        self.reads.union(&self.writes).map(String::as_str)
    }

    pub fn touches(&self, handle: &str) -> bool {
        self.reads.contains(handle) || self.writes.contains(handle)
    }

    pub fn writes_handle(&self, handle: &str) -> bool {
        self.writes.contains(handle)
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Whether two footprints must be ordered: they share a handle that at
    /// least one of them writes
    pub fn conflicts_with(&self, other: &Footprint) -> bool {
        self.writes.iter().any(|w| other.touches(w)) || other.writes.iter().any(|w| self.touches(w))
    }

    /// Stable FNV-1a digest of the footprint
    pub fn digest(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for read in &self.reads {
            hasher.write(b"r:");
            hasher.write(read.as_bytes());
            hasher.write_u8(0);
        }
        for write in &self.writes {
            hasher.write(b"w:");
            hasher.write(write.as_bytes());
            hasher.write_u8(0);
        }
        hasher.finish()
    }
}

/// One vertex of a workflow graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: EffectKind,
    pub(crate) footprint: Footprint,
    pub(crate) predecessors: Vec<NodeId>,
    pub(crate) error_policy: ErrorPolicy,
    pub(crate) collective_mode: CollectiveMode,
}

impl EffectNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EffectKind {
        self.kind
    }

    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    /// Direct ordering predecessors, ascending
    pub fn predecessors(&self) -> &[NodeId] {
        &self.predecessors
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    pub fn collective_mode(&self) -> CollectiveMode {
        self.collective_mode
    }

    /// The single handle an alloc or free node operates on
    pub fn lifecycle_handle(&self) -> Option<&str> {
        match self.kind {
            EffectKind::Alloc | EffectKind::Free => self.footprint.writes().next(),
            _ => None,
        }
    }
}

/// Finite acyclic graph of effect nodes
///
/// Node ids are dense indices in expanded program order. Edges are stored
/// as explicit adjacency over those indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub(crate) name: String,
    pub(crate) handles: BTreeMap<String, HandleDecl>,
    pub(crate) nodes: Vec<EffectNode>,
    pub(crate) successors: Vec<Vec<NodeId>>,
}

impl WorkflowGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[EffectNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&EffectNode> {
        self.nodes.get(id.index())
    }

    pub fn node_by_name(&self, name: &str) -> Option<&EffectNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn handle(&self, name: &str) -> Option<&HandleDecl> {
        self.handles.get(name)
    }

    pub fn handles(&self) -> impl Iterator<Item = &HandleDecl> {
        self.handles.values()
    }

    /// Direct successors of `id`, ascending
    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        self.successors
            .get(id.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.successors(from).binary_search(&to).is_ok()
    }

    /// Whether `to` is reachable from `from` through ordering edges
    pub fn is_ordered_before(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            for &next in self.successors(current) {
                if next == to {
                    return true;
                }
                if !visited[next.index()] {
                    visited[next.index()] = true;
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Stable digest of node kinds, footprints and edges
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for node in &self.nodes {
            hasher.write_u32(node.id.0);
            hasher.write(node.name.as_bytes());
            hasher.write(node.kind.as_str().as_bytes());
            hasher.write_u64(node.footprint.digest());
            for succ in self.successors(node.id) {
                hasher.write_u32(succ.0);
            }
        }
        hasher.finish()
    }
}

//! Programmatic graph construction and validation
//!
//! Nodes are recorded in program order. `build()` derives ordering edges
//! from footprints, adds explicit `after` edges, runs the static handle
//! lifecycle checks and rejects cycles.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use runtime_core::config::BuilderConfig;
use runtime_core::{CollectiveMode, EffectKind, Error, NodeId, ResourceClass, Result};
use tracing::debug;

use crate::graph::{EffectNode, ErrorPolicy, Footprint, HandleDecl, WorkflowGraph};
use crate::spec::NodeDecl;

/// Bounds that keep graph expansion finite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphLimits {
    pub max_repeat: u32,
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self::from(&BuilderConfig::default())
    }
}

impl From<&BuilderConfig> for GraphLimits {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            max_repeat: config.max_repeat,
            max_depth: config.max_depth,
            max_nodes: config.max_nodes,
        }
    }
}

#[derive(Debug, Clone)]
enum AfterRef {
    Node(NodeId),
    Name(String),
}

#[derive(Debug, Clone)]
struct PendingNode {
    name: String,
    base: String,
    iteration: Vec<u32>,
    kind: EffectKind,
    footprint: Footprint,
    after: Vec<AfterRef>,
    policy: ErrorPolicy,
    collective: CollectiveMode,
}

/// Lifecycle state of a symbolic handle while walking program order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Static {
    Unallocated,
    Live,
    Freed,
}

/// Incremental builder for a [`WorkflowGraph`]
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    name: String,
    limits: GraphLimits,
    handles: BTreeMap<String, HandleDecl>,
    nodes: Vec<PendingNode>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::named("workflow")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: GraphLimits::default(),
            handles: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    pub fn with_limits(mut self, limits: GraphLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> GraphLimits {
        self.limits
    }

    /// Number of nodes added so far
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Declare a symbolic handle. Redeclaring a name replaces the old entry.
    pub fn handle(&mut self, name: &str, class: ResourceClass, size_bytes: u64) -> &mut Self {
        self.declare(HandleDecl::new(name, class, size_bytes))
    }

    pub fn declare(&mut self, decl: HandleDecl) -> &mut Self {
        self.handles.insert(decl.name.clone(), decl);
        self
    }

    /// Add a node described by `decl`
    pub fn add(&mut self, decl: NodeDecl) -> NodeId {
        self.push(decl, &[])
    }

    pub(crate) fn push(&mut self, decl: NodeDecl, iteration: &[u32]) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let name = if iteration.is_empty() {
            decl.name.clone()
        } else {
            let suffix: Vec<String> = iteration.iter().map(u32::to_string).collect();
            format!("{}#{}", decl.name, suffix.join("."))
        };
        self.nodes.push(PendingNode {
            name,
            base: decl.name,
            iteration: iteration.to_vec(),
            kind: decl.kind,
            footprint: Footprint::new(decl.reads, decl.writes),
            after: decl.after.into_iter().map(AfterRef::Name).collect(),
            policy: decl.policy,
            collective: decl.collective,
        });
        id
    }

    pub fn alloc(&mut self, name: &str, handle: &str) -> NodeId {
        self.add(NodeDecl::new(name, EffectKind::Alloc).writing(&[handle]))
    }

    pub fn free(&mut self, name: &str, handle: &str) -> NodeId {
        self.add(NodeDecl::new(name, EffectKind::Free).writing(&[handle]))
    }

    pub fn compute(&mut self, name: &str, reads: &[&str], writes: &[&str]) -> NodeId {
        self.add(
            NodeDecl::new(name, EffectKind::Compute)
                .reading(reads)
                .writing(writes),
        )
    }

    pub fn copy(&mut self, name: &str, source: &str, destination: &str) -> NodeId {
        self.add(
            NodeDecl::new(name, EffectKind::Copy)
                .reading(&[source])
                .writing(&[destination]),
        )
    }

    /// All-reduce style collective that rewrites `handles` in place
    pub fn collective(&mut self, name: &str, handles: &[&str], mode: CollectiveMode) -> NodeId {
        self.add(
            NodeDecl::new(name, EffectKind::Collective)
                .writing(handles)
                .collective_mode(mode),
        )
    }

    /// Contribute the contents of `handles` to the epoch checkpoint
    pub fn checkpoint(&mut self, name: &str, handles: &[&str]) -> NodeId {
        self.add(NodeDecl::new(name, EffectKind::Checkpoint).reading(handles))
    }

    pub fn barrier(&mut self, name: &str) -> NodeId {
        self.add(NodeDecl::new(name, EffectKind::Barrier))
    }

    /// Require `node` to run after `predecessor`
    pub fn after(&mut self, node: NodeId, predecessor: NodeId) -> &mut Self {
        if let Some(pending) = self.nodes.get_mut(node.index()) {
            pending.after.push(AfterRef::Node(predecessor));
        }
        self
    }

    pub fn with_policy(&mut self, node: NodeId, policy: ErrorPolicy) -> &mut Self {
        if let Some(pending) = self.nodes.get_mut(node.index()) {
            pending.policy = policy;
        }
        self
    }

    /// Validate and freeze the graph
    pub fn build(self) -> Result<WorkflowGraph> {
        if self.nodes.len() > self.limits.max_nodes {
            return Err(Error::malformed(format!(
                "{} nodes exceed the limit of {}",
                self.nodes.len(),
                self.limits.max_nodes
            )));
        }

        self.check_names_and_handles()?;
        self.check_lifecycle()?;

        let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        self.derive_footprint_edges(&mut edges);
        self.derive_fence_edges(&mut edges);
        self.add_explicit_edges(&mut edges)?;
        self.check_acyclic(&edges)?;

        let mut predecessors: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for (from, succs) in edges.iter().enumerate() {
            for &to in succs {
                predecessors[to].push(NodeId(from as u32));
            }
        }

        let successors: Vec<Vec<NodeId>> = edges
            .into_iter()
            .map(|succs| succs.into_iter().map(|s| NodeId(s as u32)).collect())
            .collect();

        let nodes: Vec<EffectNode> = self
            .nodes
            .into_iter()
            .zip(predecessors)
            .enumerate()
            .map(|(index, (pending, mut preds))| {
                preds.sort();
                EffectNode {
                    id: NodeId(index as u32),
                    name: pending.name,
                    kind: pending.kind,
                    footprint: pending.footprint,
                    predecessors: preds,
                    error_policy: pending.policy,
                    collective_mode: pending.collective,
                }
            })
            .collect();

        let graph = WorkflowGraph {
            name: self.name,
            handles: self.handles,
            nodes,
            successors,
        };
        debug!(
            workflow = %graph.name,
            nodes = graph.len(),
            edges = graph.edge_count(),
            "Workflow graph built"
        );
        Ok(graph)
    }

    fn check_names_and_handles(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if !seen.insert(node.name.as_str()) {
                return Err(Error::malformed(format!("duplicate node name '{}'", node.name)));
            }
            for handle in node.footprint.handles() {
                if !self.handles.contains_key(handle) {
                    return Err(Error::malformed(format!(
                        "node '{}' references undeclared handle '{}'",
                        node.name, handle
                    )));
                }
            }
            if matches!(node.kind, EffectKind::Alloc | EffectKind::Free) {
                let writes = node.footprint.writes().count();
                let reads = node.footprint.reads().count();
                if writes != 1 || reads != 0 {
                    return Err(Error::InvalidFootprint {
                        node: NodeId(index as u32),
                        handle: node.footprint.handles().collect::<Vec<_>>().join(","),
                        reason: format!("{} must write exactly one handle", node.kind),
                    });
                }
            }
        }
        Ok(())
    }

    /// Walk program order and reject references outside a handle's lifetime
    fn check_lifecycle(&self) -> Result<()> {
        let mut state: HashMap<&str, Static> = self
            .handles
            .keys()
            .map(|name| (name.as_str(), Static::Unallocated))
            .collect();

        for (index, node) in self.nodes.iter().enumerate() {
            let id = NodeId(index as u32);
            for handle in node.footprint.handles() {
                let current = state.get(handle).copied().unwrap_or(Static::Unallocated);
                let violation = match (node.kind, current) {
                    (EffectKind::Alloc, Static::Live) => Some("allocated twice without a free"),
                    (EffectKind::Alloc, _) => None,
                    (EffectKind::Free, Static::Live) => None,
                    (EffectKind::Free, Static::Freed) => Some("freed twice"),
                    (_, Static::Live) => None,
                    (_, Static::Freed) => Some("referenced after free"),
                    (_, Static::Unallocated) => Some("referenced before alloc"),
                };
                if let Some(reason) = violation {
                    return Err(Error::InvalidFootprint {
                        node: id,
                        handle: handle.to_string(),
                        reason: reason.to_string(),
                    });
                }
                match node.kind {
                    EffectKind::Alloc => {
                        state.insert(handle, Static::Live);
                    }
                    EffectKind::Free => {
                        state.insert(handle, Static::Freed);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Order nodes whose footprints overlap on a handle that one of them writes
    fn derive_footprint_edges(&self, edges: &mut [BTreeSet<usize>]) {
        #[derive(Default)]
        struct Track {
            last_writer: Option<usize>,
            readers: Vec<usize>,
        }
        let mut tracks: HashMap<&str, Track> = HashMap::new();

        for (index, node) in self.nodes.iter().enumerate() {
            for handle in node.footprint.reads() {
                let track = tracks.entry(handle).or_default();
                if let Some(writer) = track.last_writer {
                    edges[writer].insert(index);
                }
                track.readers.push(index);
            }
            for handle in node.footprint.writes() {
                let track = tracks.entry(handle).or_default();
                if let Some(writer) = track.last_writer {
                    edges[writer].insert(index);
                }
                for &reader in &track.readers {
                    edges[reader].insert(index);
                }
                track.readers.clear();
                track.last_writer = Some(index);
            }
        }
    }

    /// Barriers fence everything around them; collectives keep program order
    fn derive_fence_edges(&self, edges: &mut [BTreeSet<usize>]) {
        let mut last_barrier: Option<usize> = None;
        let mut since_barrier: Vec<usize> = Vec::new();
        let mut last_collective: Option<usize> = None;

        for (index, node) in self.nodes.iter().enumerate() {
            if node.kind == EffectKind::Barrier {
                for &earlier in &since_barrier {
                    edges[earlier].insert(index);
                }
                if let Some(barrier) = last_barrier {
                    edges[barrier].insert(index);
                }
                last_barrier = Some(index);
                since_barrier.clear();
                continue;
            }

            if let Some(barrier) = last_barrier {
                edges[barrier].insert(index);
            }
            since_barrier.push(index);

            if node.kind == EffectKind::Collective {
                if let Some(previous) = last_collective {
                    edges[previous].insert(index);
                }
                last_collective = Some(index);
            }
        }
    }

    fn add_explicit_edges(&self, edges: &mut [BTreeSet<usize>]) -> Result<()> {
        let by_name: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();
        let mut by_base: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            by_base.entry(node.base.as_str()).or_default().push(index);
        }

        for (index, node) in self.nodes.iter().enumerate() {
            for reference in &node.after {
                let predecessor = match reference {
                    AfterRef::Node(id) => {
                        if id.index() >= self.nodes.len() {
                            return Err(Error::malformed(format!(
                                "node '{}' depends on unknown node {}",
                                node.name, id
                            )));
                        }
                        id.index()
                    }
                    AfterRef::Name(name) => self.resolve(index, name, &by_name, &by_base)?,
                };
                edges[predecessor].insert(index);
            }
        }
        Ok(())
    }

    /// Resolve an `after` name: exact name, then the same iteration, then
    /// the closest earlier node with that base name
    fn resolve(
        &self,
        index: usize,
        name: &str,
        by_name: &HashMap<&str, usize>,
        by_base: &HashMap<&str, Vec<usize>>,
    ) -> Result<usize> {
        if let Some(&exact) = by_name.get(name) {
            return Ok(exact);
        }
        let node = &self.nodes[index];
        let candidates = by_base.get(name).ok_or_else(|| {
            Error::malformed(format!(
                "node '{}' depends on unknown node '{}'",
                node.name, name
            ))
        })?;

        if let Some(&same) = candidates
            .iter()
            .find(|&&c| self.nodes[c].iteration == node.iteration)
        {
            return Ok(same);
        }
        if let Some(&earlier) = candidates.iter().rev().find(|&&c| c < index) {
            return Ok(earlier);
        }
        match candidates.as_slice() {
            [only] => Ok(*only),
            _ => Err(Error::malformed(format!(
                "node '{}' depends on ambiguous node '{}'",
                node.name, name
            ))),
        }
    }

    fn check_acyclic(&self, edges: &[BTreeSet<usize>]) -> Result<()> {
        let mut indegree = vec![0usize; edges.len()];
        for succs in edges {
            for &to in succs {
                indegree[to] += 1;
            }
        }

        let mut ready: Vec<usize> = (0..edges.len()).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0;
        while let Some(current) = ready.pop() {
            visited += 1;
            for &next in &edges[current] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(next);
                }
            }
        }

        if visited == edges.len() {
            return Ok(());
        }
        let stuck: Vec<&str> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| self.nodes[i].name.as_str())
            .take(8)
            .collect();
        Err(Error::malformed(format!(
            "cyclic dependency among [{}]",
            stuck.join(", ")
        )))
    }
}

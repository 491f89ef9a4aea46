//! Canonical linearization and queue assignment
//!
//! The linearization is Kahn's algorithm with the ready set ordered by node
//! id, which is the builder's program-order sequence number. Nothing about
//! timing or completion order enters the result, so the same graph and
//! topology always give the same schedule.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use runtime_core::config::TopologyConfig;
use runtime_core::{CollectiveMode, EffectKind, Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::WorkflowGraph;

/// Queue family a node is issued on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueClass {
    Control,
    Compute,
    Copy,
    Collective,
}

impl QueueClass {
    pub fn for_kind(kind: EffectKind) -> Self {
        match kind {
            EffectKind::Alloc
            | EffectKind::Free
            | EffectKind::Barrier
            | EffectKind::Checkpoint => QueueClass::Control,
            EffectKind::Compute => QueueClass::Compute,
            EffectKind::Copy => QueueClass::Copy,
            EffectKind::Collective => QueueClass::Collective,
        }
    }
}

/// Device and stream a node is issued on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueAssignment {
    pub device: u32,
    pub class: QueueClass,
    pub stream: u32,
}

impl fmt::Display for QueueAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}/{:?}/{}", self.device, self.class, self.stream)
    }
}

/// One entry of the linearization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledNode {
    pub position: usize,
    pub node: NodeId,
    pub kind: EffectKind,
    pub queue: QueueAssignment,
}

/// Canonical total order over a workflow graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    entries: Vec<ScheduledNode>,
    positions: Vec<usize>,
    deterministic: bool,
}

impl Schedule {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ScheduledNode] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledNode> {
        self.entries.iter()
    }

    /// Node ids in canonical order
    pub fn order(&self) -> Vec<NodeId> {
        self.entries.iter().map(|e| e.node).collect()
    }

    pub fn position_of(&self, node: NodeId) -> Option<usize> {
        self.positions.get(node.index()).copied()
    }

    /// False when any collective runs asynchronously; such schedules carry
    /// no reproducibility claim
    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    /// Collective nodes in the order every worker must issue them
    pub fn collective_sequence(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|e| e.kind == EffectKind::Collective)
            .map(|e| e.node)
            .collect()
    }

    /// Digest of the order and queue assignment
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for entry in &self.entries {
            hasher.write_u32(entry.node.0);
            hasher.write_u32(entry.queue.device);
            hasher.write_u8(entry.queue.class as u8);
            hasher.write_u32(entry.queue.stream);
        }
        hasher.finish()
    }

    /// Check that every edge of `graph` points forward in this schedule
    pub fn respects(&self, graph: &WorkflowGraph) -> bool {
        graph.nodes().iter().all(|node| {
            let Some(at) = self.position_of(node.id()) else {
                return false;
            };
            graph
                .successors(node.id())
                .iter()
                .all(|succ| self.position_of(*succ).is_some_and(|p| p > at))
        })
    }
}

/// Turns graphs into schedules for one worker's topology
#[derive(Debug, Clone)]
pub struct Scheduler {
    topology: TopologyConfig,
    rank: u32,
}

impl Scheduler {
    pub fn new(topology: TopologyConfig, rank: u32) -> Self {
        Self { topology, rank }
    }

    fn device(&self) -> u32 {
        self.rank % self.topology.devices.max(1)
    }

    fn assign(&self, kind: EffectKind, position: usize) -> QueueAssignment {
        let class = QueueClass::for_kind(kind);
        let streams = match class {
            QueueClass::Compute => self.topology.compute_streams.max(1),
            QueueClass::Copy => self.topology.copy_streams.max(1),
            QueueClass::Control | QueueClass::Collective => 1,
        };
        QueueAssignment {
            device: self.device(),
            class,
            stream: (position as u64 % u64::from(streams)) as u32,
        }
    }

    /// Produce the canonical linearization of `graph`
    pub fn schedule(&self, graph: &WorkflowGraph) -> Result<Schedule> {
        let count = graph.len();
        let mut indegree: Vec<usize> = graph
            .nodes()
            .iter()
            .map(|n| n.predecessors().len())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeId>> = graph
            .nodes()
            .iter()
            .filter(|n| n.predecessors().is_empty())
            .map(|n| Reverse(n.id()))
            .collect();

        let mut entries = Vec::with_capacity(count);
        let mut positions = vec![usize::MAX; count];
        let mut deterministic = true;

        while let Some(Reverse(id)) = ready.pop() {
            let node = graph.node(id).ok_or_else(|| Error::Internal {
                message: format!("scheduled unknown node {}", id),
            })?;
            let position = entries.len();
            if node.kind() == EffectKind::Collective
                && node.collective_mode() == CollectiveMode::Asynchronous
            {
                deterministic = false;
            }

            positions[id.index()] = position;
            entries.push(ScheduledNode {
                position,
                node: id,
                kind: node.kind(),
                queue: self.assign(node.kind(), position),
            });

            for &succ in graph.successors(id) {
                indegree[succ.index()] -= 1;
                if indegree[succ.index()] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        if entries.len() != count {
            return Err(Error::malformed(format!(
                "graph '{}' has a cycle; scheduled {} of {} nodes",
                graph.name(),
                entries.len(),
                count
            )));
        }

        let schedule = Schedule {
            entries,
            positions,
            deterministic,
        };
        debug!(
            workflow = %graph.name(),
            rank = self.rank,
            nodes = count,
            fingerprint = schedule.fingerprint(),
            deterministic,
            "Schedule computed"
        );
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GraphBuilder;
    use runtime_core::ResourceClass;

    fn sample_graph(mode: CollectiveMode) -> WorkflowGraph {
        let mut b = GraphBuilder::new();
        for name in ["A", "B", "G"] {
            b.handle(name, ResourceClass::Buffer, 128);
        }
        b.alloc("alloc_a", "A");
        b.alloc("alloc_b", "B");
        b.alloc("alloc_g", "G");
        b.compute("k1", &["A"], &["G"]);
        b.copy("stage", "A", "B");
        b.collective("reduce", &["G"], mode);
        b.compute("k2", &["G", "B"], &["A"]);
        b.free("free_b", "B");
        b.free("free_g", "G");
        b.free("free_a", "A");
        b.build().unwrap()
    }

    #[test]
    fn test_schedule_respects_edges() {
        let graph = sample_graph(CollectiveMode::Synchronous);
        let schedule = Scheduler::new(TopologyConfig::default(), 0)
            .schedule(&graph)
            .unwrap();

        assert_eq!(schedule.len(), graph.len());
        assert!(schedule.respects(&graph));
        assert!(schedule.is_deterministic());
    }

    #[test]
    fn test_ties_broken_by_sequence() {
        let mut b = GraphBuilder::new();
        for name in ["A", "B", "C"] {
            b.handle(name, ResourceClass::Buffer, 8);
        }
        b.alloc("c", "C");
        b.alloc("a", "A");
        b.alloc("b", "B");
        let graph = b.build().unwrap();

        let schedule = Scheduler::new(TopologyConfig::default(), 0)
            .schedule(&graph)
            .unwrap();
        assert_eq!(schedule.order(), vec![NodeId(0), NodeId(1), NodeId(2)]);
    }

    #[test]
    fn test_identical_inputs_identical_schedule() {
        let topology = TopologyConfig {
            devices: 2,
            compute_streams: 3,
            copy_streams: 2,
        };
        let first = Scheduler::new(topology.clone(), 3)
            .schedule(&sample_graph(CollectiveMode::Synchronous))
            .unwrap();
        let second = Scheduler::new(topology, 3)
            .schedule(&sample_graph(CollectiveMode::Synchronous))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert!(first.iter().all(|e| e.queue.device == 1));
    }

    #[test]
    fn test_queue_classes() {
        let graph = sample_graph(CollectiveMode::Synchronous);
        let schedule = Scheduler::new(TopologyConfig::default(), 0)
            .schedule(&graph)
            .unwrap();

        for entry in schedule.iter() {
            let expected = QueueClass::for_kind(entry.kind);
            assert_eq!(entry.queue.class, expected);
            if matches!(expected, QueueClass::Collective | QueueClass::Control) {
                assert_eq!(entry.queue.stream, 0);
            }
        }
        let reduce = graph.node_by_name("reduce").unwrap().id();
        assert_eq!(schedule.collective_sequence(), vec![reduce]);
    }

    #[test]
    fn test_async_collective_not_deterministic() {
        let graph = sample_graph(CollectiveMode::Asynchronous);
        let schedule = Scheduler::new(TopologyConfig::default(), 0)
            .schedule(&graph)
            .unwrap();
        assert!(!schedule.is_deterministic());
    }
}

//! Declarative workflow descriptions
//!
//! A [`WorkflowSpec`] is plain data (usually JSON). The only structural
//! forms are bounded `repeat` and `include` of a named template, and the
//! whole description is measured against [`GraphLimits`] before any node
//! is expanded, so expansion always terminates.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use runtime_core::{CollectiveMode, EffectKind, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::builder::{GraphBuilder, GraphLimits};
use crate::graph::{ErrorPolicy, HandleDecl, WorkflowGraph};

/// One effect node as written by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDecl {
    pub name: String,
    pub kind: EffectKind,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    /// Names of nodes that must run first
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub policy: ErrorPolicy,
    #[serde(default)]
    pub collective: CollectiveMode,
}

impl NodeDecl {
    pub fn new(name: impl Into<String>, kind: EffectKind) -> Self {
        Self {
            name: name.into(),
            kind,
            reads: Vec::new(),
            writes: Vec::new(),
            after: Vec::new(),
            policy: ErrorPolicy::default(),
            collective: CollectiveMode::default(),
        }
    }

    pub fn reading(mut self, handles: &[&str]) -> Self {
        self.reads.extend(handles.iter().map(|h| h.to_string()));
        self
    }

    pub fn writing(mut self, handles: &[&str]) -> Self {
        self.writes.extend(handles.iter().map(|h| h.to_string()));
        self
    }

    pub fn after(mut self, node: impl Into<String>) -> Self {
        self.after.push(node.into());
        self
    }

    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn collective_mode(mut self, mode: CollectiveMode) -> Self {
        self.collective = mode;
        self
    }
}

/// A step of a workflow body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Effect(NodeDecl),
    Repeat { times: u32, body: Vec<Step> },
    Include { template: String },
}

/// Declarative workflow: handles, reusable templates and a body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub handles: Vec<HandleDecl>,
    #[serde(default)]
    pub templates: BTreeMap<String, Vec<Step>>,
    pub steps: Vec<Step>,
}

impl WorkflowSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::malformed(format!("invalid workflow: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Number of nodes the spec expands to, after checking every bound
    pub fn measure(&self, limits: &GraphLimits) -> Result<usize> {
        let mut state = Measure {
            limits,
            stack: Vec::new(),
            templates: HashMap::new(),
        };
        let extent = self.measure_steps(&self.steps, &mut state, 0)?;
        Ok(extent.nodes as usize)
    }

    fn measure_steps<'a>(
        &'a self,
        steps: &'a [Step],
        state: &mut Measure<'a>,
        depth: usize,
    ) -> Result<Extent> {
        let limits = state.limits;
        if depth > limits.max_depth {
            return Err(too_deep(limits));
        }

        let mut total = Extent::default();
        for step in steps {
            let extent = match step {
                Step::Effect(_) => Extent { nodes: 1, height: 0 },
                Step::Repeat { times, body } => {
                    if *times > limits.max_repeat {
                        return Err(Error::malformed(format!(
                            "repeat count {} exceeds the limit of {}",
                            times, limits.max_repeat
                        )));
                    }
                    let body = self.measure_steps(body, state, depth + 1)?;
                    Extent {
                        nodes: body.nodes.saturating_mul(u64::from(*times)),
                        height: body.height + 1,
                    }
                }
                Step::Include { template } => {
                    let on_stack = state.stack.iter().position(|t| *t == template.as_str());
                    if let Some(position) = on_stack {
                        let mut chain: Vec<&str> = state.stack[position..].to_vec();
                        chain.push(template);
                        return Err(Error::malformed(format!(
                            "unbounded recursion through templates {}",
                            chain.join(" -> ")
                        )));
                    }
                    let (name, included) = self.templates.get_key_value(template).ok_or_else(|| {
                        Error::malformed(format!("unknown template '{}'", template))
                    })?;

                    // A measured template is acyclic; only the depth check depends on the caller
                    let body = match state.templates.get(name.as_str()).copied() {
                        Some(cached) if depth + 1 + cached.height > limits.max_depth => {
                            return Err(too_deep(limits));
                        }
                        Some(cached) => cached,
                        None => {
                            state.stack.push(name.as_str());
                            let body = self.measure_steps(included, state, depth + 1)?;
                            state.stack.pop();
                            state.templates.insert(name.as_str(), body);
                            body
                        }
                    };
                    Extent {
                        nodes: body.nodes,
                        height: body.height + 1,
                    }
                }
            };
            total.nodes = total.nodes.saturating_add(extent.nodes);
            total.height = total.height.max(extent.height);
            if total.nodes > limits.max_nodes as u64 {
                return Err(Error::malformed(format!(
                    "workflow expands past the limit of {} nodes",
                    limits.max_nodes
                )));
            }
        }
        Ok(total)
    }

    /// Expand into a validated graph
    pub fn build(&self, limits: GraphLimits) -> Result<WorkflowGraph> {
        let expected = self.measure(&limits)?;

        let mut builder = GraphBuilder::named(self.name.clone()).with_limits(limits);
        for handle in &self.handles {
            builder.declare(handle.clone());
        }

        let mut iteration = Vec::new();
        self.expand(&self.steps, &mut builder, &mut iteration);
        debug!(workflow = %self.name, nodes = expected, "Workflow expanded");

        builder.build()
    }

    fn expand(&self, steps: &[Step], builder: &mut GraphBuilder, iteration: &mut Vec<u32>) {
        for step in steps {
            match step {
                Step::Effect(decl) => {
                    builder.push(decl.clone(), iteration);
                }
                Step::Repeat { times, body } => {
                    for i in 0..*times {
                        iteration.push(i);
                        self.expand(body, builder, iteration);
                        iteration.pop();
                    }
                }
                Step::Include { template } => {
                    // measure() already proved the template exists
                    if let Some(body) = self.templates.get(template) {
                        self.expand(body, builder, iteration);
                    }
                }
            }
        }
    }
}

/// Running state of [`WorkflowSpec::measure`]
struct Measure<'a> {
    limits: &'a GraphLimits,
    /// Templates being expanded, outermost first
    stack: Vec<&'a str>,
    templates: HashMap<&'a str, Extent>,
}

/// Expanded size of a list of steps
#[derive(Debug, Clone, Copy, Default)]
struct Extent {
    nodes: u64,
    /// Nesting levels below the list itself
    height: usize,
}

fn too_deep(limits: &GraphLimits) -> Error {
    Error::malformed(format!("nesting deeper than {} levels", limits.max_depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::NodeId;

    const TRAINING: &str = r#"{
        "name": "train",
        "handles": [
            {"name": "weights", "class": "buffer", "size_bytes": 1024},
            {"name": "grads", "class": "buffer", "size_bytes": 1024}
        ],
        "templates": {
            "step": [
                {"effect": {"name": "forward", "kind": "compute", "reads": ["weights"], "writes": ["grads"]}},
                {"effect": {"name": "allreduce", "kind": "collective", "writes": ["grads"]}},
                {"effect": {"name": "update", "kind": "compute", "reads": ["grads"], "writes": ["weights"]}}
            ]
        },
        "steps": [
            {"effect": {"name": "alloc_w", "kind": "alloc", "writes": ["weights"]}},
            {"effect": {"name": "alloc_g", "kind": "alloc", "writes": ["grads"]}},
            {"repeat": {"times": 3, "body": [{"include": {"template": "step"}}]}},
            {"effect": {"name": "save", "kind": "checkpoint", "reads": ["weights"]}},
            {"effect": {"name": "free_g", "kind": "free", "writes": ["grads"]}},
            {"effect": {"name": "free_w", "kind": "free", "writes": ["weights"], "after": ["save"]}}
        ]
    }"#;

    #[test]
    fn test_expand_training_loop() {
        let spec = WorkflowSpec::from_json(TRAINING).unwrap();
        assert_eq!(spec.measure(&GraphLimits::default()).unwrap(), 2 + 9 + 3);

        let graph = spec.build(GraphLimits::default()).unwrap();
        assert_eq!(graph.len(), 14);
        assert!(graph.node_by_name("forward#0").is_some());
        assert!(graph.node_by_name("update#2").is_some());

        let update_0 = graph.node_by_name("update#0").unwrap().id();
        let forward_1 = graph.node_by_name("forward#1").unwrap().id();
        assert!(graph.has_edge(update_0, forward_1));
    }

    #[test]
    fn test_after_resolves_within_iteration() {
        let json = r#"{
            "name": "w",
            "steps": [
                {"repeat": {"times": 2, "body": [
                    {"effect": {"name": "a", "kind": "barrier"}},
                    {"effect": {"name": "b", "kind": "barrier", "after": ["a"]}}
                ]}}
            ]
        }"#;
        let graph = WorkflowSpec::from_json(json)
            .unwrap()
            .build(GraphLimits::default())
            .unwrap();
        assert!(graph.has_edge(NodeId(2), NodeId(3)));
        assert_eq!(graph.node(NodeId(3)).unwrap().name(), "b#1");
    }

    #[test]
    fn test_include_cycle_rejected() {
        let json = r#"{
            "name": "loop",
            "templates": {
                "a": [{"include": {"template": "b"}}],
                "b": [{"include": {"template": "a"}}]
            },
            "steps": [{"include": {"template": "a"}}]
        }"#;
        let err = WorkflowSpec::from_json(json)
            .unwrap()
            .build(GraphLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedGraph { .. }));
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_repeat_bounds() {
        let json = r#"{
            "name": "big",
            "steps": [{"repeat": {"times": 100, "body": [
                {"repeat": {"times": 100, "body": [
                    {"effect": {"name": "x", "kind": "barrier"}}
                ]}}
            ]}}]
        }"#;
        let spec = WorkflowSpec::from_json(json).unwrap();

        let tight = GraphLimits {
            max_repeat: 50,
            ..GraphLimits::default()
        };
        assert!(spec.measure(&tight).is_err());

        let few_nodes = GraphLimits {
            max_nodes: 500,
            ..GraphLimits::default()
        };
        assert!(spec
            .measure(&few_nodes)
            .unwrap_err()
            .to_string()
            .contains("limit of 500 nodes"));

        assert_eq!(spec.measure(&GraphLimits::default()).unwrap(), 10_000);
    }

    #[test]
    fn test_depth_bound() {
        let json = r#"{
            "name": "deep",
            "steps": [{"repeat": {"times": 1, "body": [
                {"repeat": {"times": 1, "body": [
                    {"effect": {"name": "x", "kind": "barrier"}}
                ]}}
            ]}}]
        }"#;
        let spec = WorkflowSpec::from_json(json).unwrap();
        let shallow = GraphLimits {
            max_depth: 1,
            ..GraphLimits::default()
        };
        assert!(spec.build(shallow).is_err());
        assert!(spec.build(GraphLimits::default()).is_ok());
    }

    #[test]
    fn test_wide_include_tree_measures_each_template_once() {
        // Each level includes the next eight times: 8^11 expansions if re-measured
        let mut templates = BTreeMap::new();
        for level in 0..12 {
            let body = if level == 11 {
                vec![]
            } else {
                let next = Step::Include {
                    template: format!("t{}", level + 1),
                };
                vec![next; 8]
            };
            templates.insert(format!("t{}", level), body);
        }
        let spec = WorkflowSpec {
            name: "wide".to_string(),
            handles: vec![],
            templates,
            steps: vec![Step::Include {
                template: "t0".to_string(),
            }],
        };
        assert_eq!(spec.measure(&GraphLimits::default()).unwrap(), 0);
    }

    #[test]
    fn test_reused_template_checked_at_each_depth() {
        let json = r#"{
            "name": "reuse",
            "templates": {
                "leaf": [{"repeat": {"times": 1, "body": [{"effect": {"name": "x", "kind": "barrier"}}]}}],
                "mid": [{"repeat": {"times": 1, "body": [
                    {"repeat": {"times": 1, "body": [{"include": {"template": "leaf"}}]}}
                ]}}]
            },
            "steps": [{"include": {"template": "leaf"}}, {"include": {"template": "mid"}}]
        }"#;
        let spec = WorkflowSpec::from_json(json).unwrap();

        // "leaf" fits at the top level but not under "mid"
        let err = spec
            .measure(&GraphLimits {
                max_depth: 4,
                ..GraphLimits::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("nesting deeper than 4 levels"));

        let roomy = GraphLimits {
            max_depth: 5,
            ..GraphLimits::default()
        };
        assert_eq!(spec.measure(&roomy).unwrap(), 2);
    }

    #[test]
    fn test_unknown_template() {
        let json = r#"{"name": "x", "steps": [{"include": {"template": "nope"}}]}"#;
        let err = WorkflowSpec::from_json(json)
            .unwrap()
            .build(GraphLimits::default())
            .unwrap_err();
        assert!(err.to_string().contains("unknown template 'nope'"));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            WorkflowSpec::from_json("{ not json"),
            Err(Error::MalformedGraph { .. })
        ));
    }
}

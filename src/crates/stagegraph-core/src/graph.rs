//! Core graph data structures: the node registry and the edge table
//!
//! A [`Graph`] is an explicit, static description of a workflow. It is built
//! once (normally through [`StateGraph`](crate::builder::StateGraph)),
//! validated, and then shared immutably by every run of the resulting
//! [`CompiledGraph`](crate::executor::CompiledGraph).
//!
//! # Graph Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Graph "pipeline"                                        │
//! │                                                          │
//! │  entry ─► ┌──────────┐  Conditional   ┌──────────┐       │
//! │           │ analyze  │───"ready"─────►│ generate │       │
//! │           └──────────┘                └──────────┘       │
//! │                │ "incomplete"              │ Static      │
//! │                ▼                           ▼             │
//! │           ┌──────────┐   Static      ┌──────────┐        │
//! │           │ clarify  │──────────────►│ compile  │ (T)    │
//! │           └──────────┘               └──────────┘        │
//! │                ┆ error edge                              │
//! │                ▼                                         │
//! │              END                                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Nodes** map a unique name to a [`NodeSpec`] holding the stage function.
//! - **Edges** leave each non-terminal node: one [`Edge::Static`] or one
//!   [`Edge::Conditional`].
//! - **Error edges** are optional per node and are taken when its stage fails.
//! - **Terminals** end the run after their stage completes. Routing to the
//!   virtual [`END`] target ends it as well.
//!
//! # Validation
//!
//! [`Graph::validate`] rejects, before any run:
//!
//! - a missing or unknown entry node
//! - edges whose source or target does not exist
//! - more than one outgoing edge from a node
//! - non-terminal nodes without an outgoing edge, or terminals with one
//! - routers whose declared labels are not all covered by branches
//! - nodes that are not reachable from the entry
//! - duplicate branch names inside a fan-out node

use crate::config::FailurePolicy;
use crate::error::{GraphError, Result, StageError};
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::state::{ExecutionState, StageOutput};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Node identifier, unique within a graph
pub type NodeId = String;

/// Virtual routing target that ends the run
///
/// Names starting with `__` are reserved and cannot be used for nodes.
pub const END: &str = "__end__";

/// Future returned by a stage function
pub type StageFuture = BoxFuture<'static, std::result::Result<StageOutput, StageError>>;

/// A stage function: consumes a state snapshot, produces an update
///
/// The snapshot is owned by the stage; the executor merges whatever the stage
/// returns into its own copy of the state.
pub type StageFn = Arc<dyn Fn(ExecutionState) -> StageFuture + Send + Sync>;

/// Adapt an async closure into a [`StageFn`]
///
/// The closure may return anything convertible into a [`StageOutput`], so both
/// `StateUpdate` and `ExecutionState` work.
///
/// ```rust
/// use stagegraph_core::graph::stage_fn;
/// use stagegraph_core::state::StateUpdate;
/// use serde_json::json;
///
/// let stage = stage_fn(|_state| async move {
///     Ok(StateUpdate::new().set_output("greeting", json!("hello")))
/// });
/// # let _ = stage;
/// ```
pub fn stage_fn<F, Fut, O>(func: F) -> StageFn
where
    F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O, StageError>> + Send + 'static,
    O: Into<StageOutput>,
{
    Arc::new(move |state| -> StageFuture {
        let fut = func(state);
        Box::pin(async move { fut.await.map(Into::into) })
    })
}

/// What sort of stage a node wraps, kept for validation and diagrams
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// An ordinary stage function
    Stage,
    /// A fan-out over named branches
    Parallel { branches: Vec<String> },
    /// A delegation to a nested graph
    Subworkflow { graph: String },
}

/// A registered node
#[derive(Clone)]
pub struct NodeSpec {
    pub name: NodeId,
    pub stage: StageFn,
    /// Retries applied before a failure is recorded
    pub retry: Option<RetryPolicy>,
    /// Overrides the graph's failure policy for this node
    pub failure_policy: Option<FailurePolicy>,
    pub kind: NodeKind,
}

impl NodeSpec {
    pub fn new(name: impl Into<NodeId>, stage: StageFn) -> Self {
        Self {
            name: name.into(),
            stage,
            retry: None,
            failure_policy: None,
            kind: NodeKind::Stage,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("stage", &"<function>")
            .field("retry", &self.retry)
            .field("failure_policy", &self.failure_policy)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A transition out of a node
#[derive(Debug, Clone)]
pub enum Edge {
    /// Always go to `to`
    Static { from: NodeId, to: NodeId },

    /// Ask `router` for a label and go to `branches[label]`
    Conditional {
        from: NodeId,
        router: Router,
        branches: BTreeMap<String, NodeId>,
    },
}

impl Edge {
    pub fn source(&self) -> &str {
        match self {
            Edge::Static { from, .. } | Edge::Conditional { from, .. } => from,
        }
    }

    /// Every node this edge can lead to (may include [`END`])
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Edge::Static { to, .. } => vec![to.as_str()],
            Edge::Conditional { branches, .. } => branches.values().map(String::as_str).collect(),
        }
    }
}

/// The static workflow description
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Graph name, used in logs, run context and sub-workflow summaries
    pub name: String,

    /// Node registry
    pub nodes: HashMap<NodeId, NodeSpec>,

    /// Node names in registration order
    pub order: Vec<NodeId>,

    /// Edge table (at most one entry per source after validation)
    pub edges: Vec<Edge>,

    /// Failure routes: node → target taken when the node's stage fails
    pub error_edges: BTreeMap<NodeId, NodeId>,

    pub entry: Option<NodeId>,

    pub terminals: BTreeSet<NodeId>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Register a node
    ///
    /// # Errors
    ///
    /// [`GraphError::DuplicateNode`] if the name is taken, and
    /// [`GraphError::Validation`] if it is reserved.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<()> {
        if spec.name.starts_with("__") {
            return Err(GraphError::validation(format!(
                "node name '{}' is reserved",
                spec.name
            )));
        }
        if self.nodes.contains_key(&spec.name) {
            return Err(GraphError::DuplicateNode(spec.name));
        }
        self.order.push(spec.name.clone());
        self.nodes.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) {
        self.edges.push(Edge::Static {
            from: from.into(),
            to: to.into(),
        });
    }

    pub fn add_conditional_edge(
        &mut self,
        from: impl Into<NodeId>,
        router: Router,
        branches: BTreeMap<String, NodeId>,
    ) {
        self.edges.push(Edge::Conditional {
            from: from.into(),
            router,
            branches,
        });
    }

    pub fn add_error_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) {
        self.error_edges.insert(from.into(), to.into());
    }

    pub fn set_entry(&mut self, node: impl Into<NodeId>) {
        self.entry = Some(node.into());
    }

    pub fn add_terminal(&mut self, node: impl Into<NodeId>) {
        self.terminals.insert(node.into());
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    /// The single outgoing edge of `node`, if any
    pub fn outgoing(&self, node: &str) -> Option<&Edge> {
        self.edges.iter().find(|edge| edge.source() == node)
    }

    pub fn error_edge(&self, node: &str) -> Option<&str> {
        self.error_edges.get(node).map(String::as_str)
    }

    pub fn is_terminal(&self, node: &str) -> bool {
        self.terminals.contains(node)
    }

    fn exists(&self, target: &str) -> bool {
        target == END || self.nodes.contains_key(target)
    }

    /// Check the structural invariants listed in the module docs
    pub fn validate(&self) -> Result<()> {
        let entry = self
            .entry
            .as_deref()
            .ok_or_else(|| GraphError::validation("entry point not set"))?;
        if !self.nodes.contains_key(entry) {
            return Err(GraphError::validation(format!(
                "entry point '{}' does not exist",
                entry
            )));
        }

        let mut seen_sources = BTreeSet::new();
        for edge in &self.edges {
            let from = edge.source();
            if !self.nodes.contains_key(from) {
                return Err(GraphError::validation(format!(
                    "edge source '{}' does not exist",
                    from
                )));
            }
            if !seen_sources.insert(from) {
                return Err(GraphError::validation(format!(
                    "node '{}' has more than one outgoing edge",
                    from
                )));
            }
            if let Some(missing) = edge.targets().into_iter().find(|to| !self.exists(to)) {
                return Err(GraphError::validation(format!(
                    "edge target '{}' from '{}' does not exist",
                    missing, from
                )));
            }
            if let Edge::Conditional {
                router, branches, ..
            } = edge
            {
                if branches.is_empty() {
                    return Err(GraphError::validation(format!(
                        "conditional edge from '{}' has no branches",
                        from
                    )));
                }
                if let Some(labels) = router.labels() {
                    if let Some(label) = labels.iter().find(|l| !branches.contains_key(*l)) {
                        return Err(GraphError::validation(format!(
                            "router on '{}' can return '{}' but no branch handles it",
                            from, label
                        )));
                    }
                }
            }
        }

        for (from, to) in &self.error_edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::validation(format!(
                    "error edge source '{}' does not exist",
                    from
                )));
            }
            if !self.exists(to) {
                return Err(GraphError::validation(format!(
                    "error edge target '{}' from '{}' does not exist",
                    to, from
                )));
            }
        }

        for terminal in &self.terminals {
            if !self.nodes.contains_key(terminal) {
                return Err(GraphError::validation(format!(
                    "terminal '{}' does not exist",
                    terminal
                )));
            }
            if seen_sources.contains(terminal.as_str()) {
                return Err(GraphError::validation(format!(
                    "terminal '{}' must not have an outgoing edge",
                    terminal
                )));
            }
        }

        for name in &self.order {
            if !self.is_terminal(name) && !seen_sources.contains(name.as_str()) {
                return Err(GraphError::validation(format!(
                    "node '{}' is neither terminal nor has an outgoing edge",
                    name
                )));
            }
        }

        for spec in self.nodes.values() {
            if let NodeKind::Parallel { branches } = &spec.kind {
                let mut names = BTreeSet::new();
                if let Some(dup) = branches.iter().find(|b| !names.insert(b.as_str())) {
                    return Err(GraphError::validation(format!(
                        "fan-out node '{}' declares branch '{}' twice",
                        spec.name, dup
                    )));
                }
            }
        }

        let reachable = self.reachable_from(entry);
        if let Some(orphan) = self.order.iter().find(|n| !reachable.contains(n.as_str())) {
            return Err(GraphError::validation(format!(
                "node '{}' is not reachable from entry '{}'",
                orphan, entry
            )));
        }

        Ok(())
    }

    /// Nodes reachable from `start` over regular and error edges
    pub fn reachable_from(&self, start: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);

        while let Some(node) = queue.pop_front() {
            if node == END || !visited.insert(node.clone()) {
                continue;
            }
            if let Some(edge) = self.outgoing(&node) {
                queue.extend(edge.targets().into_iter().map(str::to_string));
            }
            if let Some(target) = self.error_edge(&node) {
                queue.push_back(target.to_string());
            }
        }

        visited
    }
}

/// Named stage functions and routers for declarative graphs
///
/// See [`GraphDefinition`](crate::definition::GraphDefinition).
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, StageFn>,
    routers: HashMap<String, Router>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_stage(&mut self, name: impl Into<String>, stage: StageFn) -> &mut Self {
        self.stages.insert(name.into(), stage);
        self
    }

    pub fn register_router(&mut self, name: impl Into<String>, router: Router) -> &mut Self {
        self.routers.insert(name.into(), router);
        self
    }

    pub fn stage(&self, name: &str) -> Option<StageFn> {
        self.stages.get(name).cloned()
    }

    pub fn router(&self, name: &str) -> Option<Router> {
        self.routers.get(name).cloned()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<_> = self.stages.keys().collect();
        let mut routers: Vec<_> = self.routers.keys().collect();
        stages.sort();
        routers.sort();
        f.debug_struct("StageRegistry")
            .field("stages", &stages)
            .field("routers", &routers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateUpdate;

    fn noop() -> StageFn {
        stage_fn(|_| async { Ok(StateUpdate::new()) })
    }

    fn linear() -> Graph {
        let mut graph = Graph::new("linear");
        graph.add_node(NodeSpec::new("a", noop())).unwrap();
        graph.add_node(NodeSpec::new("b", noop())).unwrap();
        graph.add_edge("a", "b");
        graph.set_entry("a");
        graph.add_terminal("b");
        graph
    }

    fn assert_invalid(graph: &Graph, needle: &str) {
        match graph.validate() {
            Err(GraphError::Validation(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {}", msg)
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_linear_graph() {
        assert!(linear().validate().is_ok());
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let mut graph = linear();
        assert!(matches!(
            graph.add_node(NodeSpec::new("a", noop())),
            Err(GraphError::DuplicateNode(name)) if name == "a"
        ));
        assert!(matches!(
            graph.add_node(NodeSpec::new("__end__", noop())),
            Err(GraphError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_entry() {
        let mut graph = linear();
        graph.entry = None;
        assert_invalid(&graph, "entry point not set");

        graph.set_entry("ghost");
        assert_invalid(&graph, "'ghost' does not exist");
    }

    #[test]
    fn test_unknown_edge_target() {
        let mut graph = linear();
        graph.terminals.clear();
        graph.add_edge("b", "nowhere");
        assert_invalid(&graph, "'nowhere'");
    }

    #[test]
    fn test_two_outgoing_edges() {
        let mut graph = linear();
        graph.add_edge("a", END);
        assert_invalid(&graph, "more than one outgoing edge");
    }

    #[test]
    fn test_dangling_non_terminal() {
        let mut graph = linear();
        graph.terminals.clear();
        assert_invalid(&graph, "neither terminal nor has an outgoing edge");
    }

    #[test]
    fn test_terminal_with_edge() {
        let mut graph = linear();
        graph.add_edge("b", END);
        assert_invalid(&graph, "must not have an outgoing edge");
    }

    #[test]
    fn test_unreachable_node() {
        let mut graph = linear();
        graph.add_node(NodeSpec::new("island", noop())).unwrap();
        graph.add_terminal("island");
        assert_invalid(&graph, "'island' is not reachable");
    }

    #[test]
    fn test_error_edge_makes_node_reachable() {
        let mut graph = linear();
        graph.add_node(NodeSpec::new("recover", noop())).unwrap();
        graph.add_terminal("recover");
        graph.add_error_edge("a", "recover");
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_router_label_coverage() {
        let mut graph = Graph::new("routed");
        graph.add_node(NodeSpec::new("a", noop())).unwrap();
        graph.add_node(NodeSpec::new("b", noop())).unwrap();
        graph.set_entry("a");
        graph.add_terminal("b");
        graph.add_conditional_edge(
            "a",
            Router::new(|_| "go".to_string()).with_labels(["go", "stop"]),
            BTreeMap::from([("go".to_string(), "b".to_string())]),
        );
        assert_invalid(&graph, "can return 'stop'");
    }

    #[test]
    fn test_duplicate_fanout_branches() {
        let mut graph = Graph::new("fan");
        graph
            .add_node(NodeSpec::new("fan", noop()).with_kind(NodeKind::Parallel {
                branches: vec!["x".to_string(), "x".to_string()],
            }))
            .unwrap();
        graph.set_entry("fan");
        graph.add_terminal("fan");
        assert_invalid(&graph, "declares branch 'x' twice");
    }

    #[test]
    fn test_outgoing_and_targets() {
        let graph = linear();
        let edge = graph.outgoing("a").unwrap();
        assert_eq!(edge.source(), "a");
        assert_eq!(edge.targets(), vec!["b"]);
        assert!(graph.outgoing("b").is_none());
        assert!(graph.is_terminal("b"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = StageRegistry::new();
        registry
            .register_stage("noop", noop())
            .register_router("always", Router::new(|_| "x".to_string()));

        assert!(registry.stage("noop").is_some());
        assert!(registry.stage("missing").is_none());
        assert!(registry.router("always").is_some());
    }
}

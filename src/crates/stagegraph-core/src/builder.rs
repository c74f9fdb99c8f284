//! `StateGraph` builder API for constructing workflows
//!
//! [`StateGraph`] is the construction surface of the engine. Nodes, edges and
//! terminals are registered with chained `&mut self` calls; [`compile`]
//! validates the result and produces an immutable
//! [`CompiledGraph`](crate::executor::CompiledGraph).
//!
//! Mistakes made while building (a duplicate node name, a reserved name, a
//! policy for a node that never appears) are remembered and reported by
//! `compile`, so a chain of builder calls never has to be interrupted.
//!
//! # Quick Start
//!
//! ```rust
//! use stagegraph_core::builder::StateGraph;
//! use stagegraph_core::router::Router;
//! use stagegraph_core::state::{ExecutionState, StateUpdate};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new("triage");
//! graph
//!     .add_node_fn("inspect", |_| async { Ok(StateUpdate::new()) })
//!     .add_node_fn("build", |_| async {
//!         Ok(StateUpdate::new().set_output("artifact", json!("game.py")))
//!     })
//!     .add_node_fn("clarify", |_| async {
//!         Ok(StateUpdate::new().set_output("question", json!("which engine?")))
//!     })
//!     .add_conditional_edge(
//!         "inspect",
//!         Router::from_context("status", "incomplete"),
//!         [("ready", "build"), ("incomplete", "clarify")],
//!     )
//!     .set_entry("inspect")
//!     .add_terminal("build")
//!     .add_terminal("clarify");
//!
//! let compiled = graph.compile()?;
//! let result = compiled
//!     .invoke(ExecutionState::new().with_context("status", json!("ready")))
//!     .await;
//!
//! assert!(result.success);
//! assert_eq!(result.outputs["artifact"], json!("game.py"));
//! # Ok(())
//! # }
//! ```
//!
//! [`compile`]: StateGraph::compile

use crate::config::{ExecutionConfig, FailurePolicy};
use crate::error::{GraphError, Result, StageError};
use crate::executor::{CompiledGraph, SuccessPredicate};
use crate::graph::{stage_fn, Graph, NodeId, NodeKind, NodeSpec, StageFn};
use crate::parallel::ParallelStage;
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::state::{ExecutionState, StageOutput};
use crate::subworkflow::SubworkflowStage;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Builder for [`CompiledGraph`]s
pub struct StateGraph {
    graph: Graph,
    policies: BTreeMap<NodeId, FailurePolicy>,
    success_predicate: Option<SuccessPredicate>,
    errors: Vec<GraphError>,
}

impl StateGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(name),
            policies: BTreeMap::new(),
            success_predicate: None,
            errors: Vec::new(),
        }
    }

    /// Register a fully specified node
    pub fn add_node_spec(&mut self, spec: NodeSpec) -> &mut Self {
        if let Err(err) = self.graph.add_node(spec) {
            self.errors.push(err);
        }
        self
    }

    /// Register a stage function under `name`
    pub fn add_node(&mut self, name: impl Into<NodeId>, stage: StageFn) -> &mut Self {
        self.add_node_spec(NodeSpec::new(name, stage))
    }

    /// Register an async closure under `name`
    ///
    /// The closure may return a `StateUpdate` or a whole `ExecutionState`.
    pub fn add_node_fn<F, Fut, O>(&mut self, name: impl Into<NodeId>, func: F) -> &mut Self
    where
        F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, StageError>> + Send + 'static,
        O: Into<StageOutput>,
    {
        self.add_node(name, stage_fn(func))
    }

    /// Register a stage that is retried on failure
    pub fn add_node_with_retry(
        &mut self,
        name: impl Into<NodeId>,
        stage: StageFn,
        policy: RetryPolicy,
    ) -> &mut Self {
        self.add_node_spec(NodeSpec::new(name, stage).with_retry(policy))
    }

    /// Register a fan-out node
    pub fn add_parallel(&mut self, name: impl Into<NodeId>, stage: ParallelStage) -> &mut Self {
        let kind = NodeKind::Parallel {
            branches: stage.branch_names(),
        };
        self.add_node_spec(NodeSpec::new(name, stage.into_stage()).with_kind(kind))
    }

    /// Register a node that delegates to a nested graph
    pub fn add_subworkflow(
        &mut self,
        name: impl Into<NodeId>,
        stage: SubworkflowStage,
    ) -> &mut Self {
        let kind = NodeKind::Subworkflow {
            graph: stage.child().name().to_string(),
        };
        self.add_node_spec(NodeSpec::new(name, stage.into_stage()).with_kind(kind))
    }

    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.graph.add_edge(from, to);
        self
    }

    /// Add a conditional edge
    ///
    /// `branches` maps each label the router can return to a target node (or
    /// [`END`](crate::graph::END)).
    pub fn add_conditional_edge<I, L, T>(
        &mut self,
        from: impl Into<NodeId>,
        router: Router,
        branches: I,
    ) -> &mut Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<NodeId>,
    {
        let branches = branches
            .into_iter()
            .map(|(label, to)| (label.into(), to.into()))
            .collect();
        self.graph.add_conditional_edge(from, router, branches);
        self
    }

    /// Route to `to` when the stage of `from` fails
    pub fn add_error_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.graph.add_error_edge(from, to);
        self
    }

    pub fn set_entry(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.graph.set_entry(node);
        self
    }

    pub fn add_terminal(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.graph.add_terminal(node);
        self
    }

    /// Override the failure policy of one node
    pub fn with_failure_policy(&mut self, node: impl Into<NodeId>, policy: FailurePolicy) -> &mut Self {
        self.policies.insert(node.into(), policy);
        self
    }

    /// Replace the default "no errors recorded" success rule
    pub fn with_success_predicate<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        self.success_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Validate and compile with default settings
    pub fn compile(self) -> Result<CompiledGraph> {
        self.compile_with_config(ExecutionConfig::default())
    }

    /// Validate and compile with explicit settings
    ///
    /// # Errors
    ///
    /// The first problem recorded while building (for example
    /// [`GraphError::DuplicateNode`]), otherwise any structural problem found
    /// by [`Graph::validate`], or an invalid `config`.
    pub fn compile_with_config(mut self, config: ExecutionConfig) -> Result<CompiledGraph> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        config.validate()?;

        for (node, policy) in self.policies {
            let spec = self.graph.nodes.get_mut(&node).ok_or_else(|| {
                GraphError::validation(format!(
                    "failure policy set for unknown node '{}'",
                    node
                ))
            })?;
            spec.failure_policy = Some(policy);
        }

        for name in &self.graph.order {
            if let Some(policy) = self.graph.node(name).and_then(|spec| spec.retry.as_ref()) {
                policy.validate_for(name)?;
            }
        }

        self.graph.validate()?;
        let entry = self
            .graph
            .entry
            .clone()
            .ok_or_else(|| GraphError::validation("entry point not set"))?;

        tracing::debug!(
            graph = %self.graph.name,
            nodes = self.graph.nodes.len(),
            edges = self.graph.edges.len(),
            "Compiled graph"
        );

        Ok(CompiledGraph::new(
            self.graph,
            entry,
            config,
            self.success_predicate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::END;
    use crate::state::StateUpdate;

    fn noop(_: ExecutionState) -> futures::future::Ready<std::result::Result<StateUpdate, StageError>> {
        futures::future::ready(Ok(StateUpdate::new()))
    }

    #[test]
    fn test_duplicate_reported_at_compile() {
        let mut graph = StateGraph::new("dup");
        graph
            .add_node_fn("a", noop)
            .add_node_fn("a", noop)
            .set_entry("a")
            .add_terminal("a");

        match graph.compile() {
            Err(GraphError::DuplicateNode(name)) => assert_eq!(name, "a"),
            other => panic!("expected duplicate error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_reserved_name_rejected() {
        let mut graph = StateGraph::new("reserved");
        graph.add_node_fn(END, noop);
        assert!(matches!(graph.compile(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_policy_for_unknown_node() {
        let mut graph = StateGraph::new("policy");
        graph
            .add_node_fn("a", noop)
            .set_entry("a")
            .add_terminal("a")
            .with_failure_policy("ghost", FailurePolicy::Continue);

        let err = graph.compile().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_policy_applied_to_node() {
        let mut graph = StateGraph::new("policy");
        graph
            .add_node_fn("a", noop)
            .set_entry("a")
            .add_terminal("a")
            .with_failure_policy("a", FailurePolicy::Continue);

        let compiled = graph.compile().unwrap();
        assert_eq!(
            compiled.graph().node("a").unwrap().failure_policy,
            Some(FailurePolicy::Continue)
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut graph = StateGraph::new("cfg");
        graph.add_node_fn("a", noop).set_entry("a").add_terminal("a");

        let result = graph.compile_with_config(ExecutionConfig::default().with_max_steps(0));
        assert!(matches!(result, Err(GraphError::Configuration(_))));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let policy = RetryPolicy {
            backoff_factor: 0.25,
            ..RetryPolicy::default()
        };
        let mut graph = StateGraph::new("retry");
        graph
            .add_node_with_retry("a", stage_fn(noop), policy)
            .set_entry("a")
            .add_terminal("a");

        match graph.compile() {
            Err(GraphError::Configuration(msg)) => {
                assert!(msg.starts_with("node 'a': retry backoff_factor"), "{}", msg)
            }
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_conditional_branches_collected() {
        let mut graph = StateGraph::new("branches");
        graph
            .add_node_fn("a", noop)
            .add_node_fn("b", noop)
            .add_conditional_edge("a", Router::new(|_| "b".to_string()), [("b", "b"), ("quit", END)])
            .set_entry("a")
            .add_terminal("b");

        let compiled = graph.compile().unwrap();
        let edge = compiled.graph().outgoing("a").unwrap();
        assert_eq!(edge.targets(), vec!["b", END]);
    }
}

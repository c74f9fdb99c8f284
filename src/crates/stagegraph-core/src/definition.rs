//! YAML-based graph definitions
//!
//! A [`GraphDefinition`] describes a graph's shape declaratively. Stage
//! functions and routers are referenced by name and resolved against a
//! [`StageRegistry`] when the definition is built.
//!
//! ```yaml
//! name: triage
//! entry: inspect
//! terminals: [build, clarify]
//!
//! nodes:
//!   inspect:
//!     handler: inspect_request
//!     retry:
//!       max_attempts: 3
//!   build:
//!     handler: build_game
//!   clarify:
//!     branches:
//!       engine: ask_engine
//!       genre: ask_genre
//!
//! edges:
//!   - from: inspect
//!     router: readiness
//!     branches:
//!       ready: build
//!       incomplete: clarify
//!
//! error_edges:
//!   build: clarify
//! ```

use crate::builder::StateGraph;
use crate::config::{ExecutionConfig, FailurePolicy};
use crate::error::{GraphError, Result};
use crate::executor::CompiledGraph;
use crate::graph::{NodeId, StageRegistry};
use crate::parallel::{Branch, ParallelStage};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level YAML graph definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub entry: NodeId,

    #[serde(default)]
    pub terminals: Vec<NodeId>,

    pub nodes: BTreeMap<NodeId, NodeDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    #[serde(default)]
    pub error_edges: BTreeMap<NodeId, NodeId>,

    /// Execution settings; defaults apply when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionConfig>,
}

/// Node definition
///
/// Exactly one of `handler` (a single stage) or `branches` (a fan-out of
/// named branch handlers) must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Fan-out branches: branch name → handler name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branches: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
}

/// Edge definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeDefinition {
    Static {
        from: NodeId,
        to: NodeId,
    },
    Conditional {
        from: NodeId,
        router: String,
        branches: BTreeMap<String, NodeId>,
    },
}

impl GraphDefinition {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Resolve handler and router names and produce a builder
    ///
    /// # Errors
    ///
    /// [`GraphError::Validation`] when a name is missing from `registry` or a
    /// node declares neither or both of `handler` and `branches`, and
    /// [`GraphError::Configuration`] for an unusable retry policy.
    pub fn build(&self, registry: &StageRegistry) -> Result<StateGraph> {
        let mut graph = StateGraph::new(self.name.clone());

        for (name, node) in &self.nodes {
            match (&node.handler, node.branches.is_empty()) {
                (Some(handler), true) => {
                    let stage = lookup_stage(registry, name, handler)?;
                    match &node.retry {
                        Some(policy) => {
                            policy.validate_for(name)?;
                            graph.add_node_with_retry(name.clone(), stage, policy.clone())
                        }
                        None => graph.add_node(name.clone(), stage),
                    };
                }
                (None, false) => {
                    let branches = node
                        .branches
                        .iter()
                        .map(|(branch, handler)| {
                            lookup_stage(registry, name, handler).map(|stage| Branch::new(branch.clone(), stage))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let mut parallel = ParallelStage::new(branches);
                    if let Some(limit) = node.max_concurrency {
                        parallel = parallel.with_max_concurrency(limit);
                    }
                    graph.add_parallel(name.clone(), parallel);
                }
                _ => {
                    return Err(GraphError::validation(format!(
                        "node '{}' must declare exactly one of 'handler' or 'branches'",
                        name
                    )))
                }
            }

            if let Some(policy) = node.failure_policy {
                graph.with_failure_policy(name.clone(), policy);
            }
        }

        for edge in &self.edges {
            match edge {
                EdgeDefinition::Static { from, to } => {
                    graph.add_edge(from.clone(), to.clone());
                }
                EdgeDefinition::Conditional {
                    from,
                    router,
                    branches,
                } => {
                    let resolved = registry.router(router).ok_or_else(|| {
                        GraphError::validation(format!(
                            "router '{}' used by '{}' is not registered",
                            router, from
                        ))
                    })?;
                    graph.add_conditional_edge(from.clone(), resolved, branches.clone());
                }
            }
        }

        for (from, to) in &self.error_edges {
            graph.add_error_edge(from.clone(), to.clone());
        }
        for terminal in &self.terminals {
            graph.add_terminal(terminal.clone());
        }
        graph.set_entry(self.entry.clone());

        Ok(graph)
    }

    /// Build and compile using the definition's execution settings
    pub fn compile(&self, registry: &StageRegistry) -> Result<CompiledGraph> {
        let config = self.execution.clone().unwrap_or_default();
        self.build(registry)?.compile_with_config(config)
    }
}

fn lookup_stage(
    registry: &StageRegistry,
    node: &str,
    handler: &str,
) -> Result<crate::graph::StageFn> {
    registry.stage(handler).ok_or_else(|| {
        GraphError::validation(format!(
            "handler '{}' used by node '{}' is not registered",
            handler, node
        ))
    })
}

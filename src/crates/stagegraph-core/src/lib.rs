//! # stagegraph-core - Graph-Based Workflow Orchestration
//!
//! `stagegraph-core` runs multi-stage pipelines described as a directed graph
//! of named stages. A single [`ExecutionState`] is threaded through the run;
//! stages return partial updates that the executor merges, conditional edges
//! pick the next stage from the current state, fan-out nodes run independent
//! branches concurrently, and a stage may delegate to an entire nested graph.
//!
//! ## Core Concepts
//!
//! ### 1. StateGraph - Construction
//!
//! [`StateGraph`] registers nodes, static and conditional edges, error edges,
//! the entry node and terminal nodes. [`StateGraph::compile`] validates the
//! structure (unique names, reachability, router label coverage) and produces
//! a [`CompiledGraph`].
//!
//! ### 2. CompiledGraph - Execution
//!
//! [`CompiledGraph::run`] walks the graph from its entry until a terminal node
//! completes. It never returns an error: stage failures, unknown routes,
//! exhausted step budgets and cancellations all become [`ErrorRecord`]s in the
//! final state, and overall success is derived from that log.
//!
//! ### 3. Fan-out and Join
//!
//! [`ParallelStage`] forks the state into named branches, runs them on the
//! tokio runtime (optionally bounded), waits for all of them, and joins their
//! results into disjoint `branch_results` keys. One branch failing never
//! affects its siblings.
//!
//! ### 4. Sub-workflows
//!
//! [`SubworkflowStage`] runs a child graph on a derived sub-state and stores
//! the child's outputs under one output key. Child failures are summarised
//! into a single record on the delegating node.
//!
//! ## Quick Start
//!
//! ```rust
//! use stagegraph_core::{
//!     Branch, ExecutionState, ParallelStage, Router, StageError, StateGraph, StateUpdate,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = StateGraph::new("content");
//! graph
//!     .add_node_fn("analyze", |state: ExecutionState| async move {
//!         let ready = state.current_task.is_some();
//!         Ok(StateUpdate::new().set_context("ready", json!(ready)))
//!     })
//!     .add_parallel(
//!         "generate",
//!         ParallelStage::new(vec![
//!             Branch::from_fn("dialogue", |_| async {
//!                 Ok(StateUpdate::new().set_output("lines", json!(["hi"])))
//!             }),
//!             Branch::from_fn("audio", |_| async {
//!                 Err::<StateUpdate, _>(StageError::failed("no sound engine"))
//!             }),
//!         ]),
//!     )
//!     .add_node_fn("ask", |_| async { Ok(StateUpdate::new()) })
//!     .add_conditional_edge(
//!         "analyze",
//!         Router::new(|s| match s.context_value("ready").and_then(|v| v.as_bool()) {
//!             Some(true) => "ready".to_string(),
//!             _ => "incomplete".to_string(),
//!         }),
//!         [("ready", "generate"), ("incomplete", "ask")],
//!     )
//!     .set_entry("analyze")
//!     .add_terminal("generate")
//!     .add_terminal("ask");
//!
//! let result = graph
//!     .compile()?
//!     .invoke(ExecutionState::new().with_task("a dungeon crawler"))
//!     .await;
//!
//! assert!(!result.success);
//! assert_eq!(result.branch_results.len(), 2);
//! assert_eq!(result.errors.len(), 1);
//! assert_eq!(result.errors[0].branch.as_deref(), Some("audio"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`state`] - execution state, partial updates and the merge rule
//! - [`graph`] - node registry, edge table and validation
//! - [`builder`] - the [`StateGraph`] construction API
//! - [`executor`] - the run loop
//! - [`router`] - conditional edge evaluation
//! - [`parallel`] - fan-out dispatch and join
//! - [`subworkflow`] - nested graph delegation
//! - [`runtime`] - task-local run context
//! - [`retry`] - per-node retry policies
//! - [`config`] - execution settings
//! - [`definition`] - YAML graph definitions
//! - [`visualization`] - Mermaid diagrams

pub mod builder;
pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod graph;
pub mod parallel;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod state;
pub mod subworkflow;
pub mod visualization;

pub use builder::StateGraph;
pub use config::{ExecutionConfig, FailurePolicy};
pub use definition::GraphDefinition;
pub use error::{ErrorKind, ErrorRecord, GraphError, Result, StageError};
pub use executor::{CompiledGraph, RunOutcome, SuccessPredicate};
pub use graph::{stage_fn, Edge, Graph, NodeId, NodeKind, NodeSpec, StageFn, StageRegistry, END};
pub use parallel::{dispatch, join, Branch, BranchResult, BranchStatus, DispatchOptions, ParallelStage};
pub use retry::{RetryPolicy, RetryState};
pub use router::{Router, Transition};
pub use runtime::RunContext;
pub use state::{ExecutionState, Message, MessageRole, RunResult, StageOutput, StateUpdate, ValueMap};
pub use subworkflow::SubworkflowStage;
pub use visualization::{visualize_mermaid, VisualizationOptions};

//! The graph executor
//!
//! [`CompiledGraph`] walks a validated [`Graph`] from its entry node,
//! invoking each node's stage on a snapshot of the [`ExecutionState`] and
//! merging the stage's output back in. After each node it decides where to go:
//!
//! ```text
//!         ┌──────────────────────────────────────────────┐
//!         ▼                                              │
//!   run stage (with retries) ──ok──► merge update        │
//!         │                             │                │
//!        err                     terminal? ──yes──► stop │
//!         │                             │ no             │
//!   record ErrorRecord           resolve edge ───────────┘
//!         │                        (router on merged state)
//!   error edge? ──yes──► follow it
//!         │ no
//!   policy = continue? ──yes──► treat as success
//!         │ no
//!       halt
//! ```
//!
//! A run never returns an error to the caller. Every failure becomes an
//! [`ErrorRecord`] in the final state and `success` is derived from the error
//! log (or from a custom success predicate when the graph declares one).
//!
//! Runs end when:
//!
//! - a terminal node completes, or a route leads to [`END`](crate::graph::END)
//! - a stage fails and no error edge or `continue` policy applies
//! - a router returns a label with no branch (`UnknownRoute`)
//! - `max_steps` transitions have been taken (`RoutingLoop`)
//! - the run's cancellation token fires (`Cancelled`)

use crate::config::{ExecutionConfig, FailurePolicy};
use crate::error::{ErrorRecord, StageError};
use crate::graph::{Graph, NodeId, NodeSpec};
use crate::retry::RetryState;
use crate::router::{resolve_next, Transition};
use crate::runtime::{self, RunContext};
use crate::state::{ExecutionState, RunResult, StageOutput};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decides overall success from the final state
pub type SuccessPredicate = Arc<dyn Fn(&ExecutionState) -> bool + Send + Sync>;

/// A validated graph ready to run
///
/// Cheap to clone; every clone shares the same graph definition.
#[derive(Clone)]
pub struct CompiledGraph {
    graph: Arc<Graph>,
    entry: NodeId,
    config: Arc<ExecutionConfig>,
    success_predicate: Option<SuccessPredicate>,
}

/// Everything known about a finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final execution state
    pub state: ExecutionState,
    pub success: bool,
    /// Nodes whose stages ran, in order
    pub path: Vec<NodeId>,
    /// Transitions taken
    pub steps: usize,
}

impl RunOutcome {
    pub fn into_result(self) -> RunResult {
        self.state.into_result(self.success)
    }
}

/// How control leaves a node after its stage settled
enum Step {
    Goto(NodeId),
    Stop,
}

impl CompiledGraph {
    pub(crate) fn new(
        graph: Graph,
        entry: NodeId,
        config: ExecutionConfig,
        success_predicate: Option<SuccessPredicate>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            entry,
            config: Arc::new(config),
            success_predicate,
        }
    }

    pub fn name(&self) -> &str {
        &self.graph.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Replace the execution settings
    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Run to completion
    pub async fn run(&self, state: ExecutionState) -> RunOutcome {
        self.run_with_cancel(state, CancellationToken::new()).await
    }

    /// Run to completion, stopping early if `cancel` fires
    ///
    /// Cancellation is cooperative: it is observed between nodes, by fan-out
    /// branches and by retry back-off, never by aborting a stage mid-flight.
    pub async fn run_with_cancel(
        &self,
        state: ExecutionState,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let ctx = RunContext::new(self.graph.name.clone(), self.config.clone()).with_cancel(cancel);
        self.execute(state, ctx).await
    }

    /// Run and return only the caller-facing result
    pub async fn invoke(&self, state: ExecutionState) -> RunResult {
        self.run(state).await.into_result()
    }

    /// Run as a child of the run described by `parent`
    pub(crate) async fn run_nested(&self, state: ExecutionState, parent: &RunContext) -> RunOutcome {
        let ctx = RunContext::new(self.graph.name.clone(), self.config.clone())
            .with_run_id(parent.run_id)
            .with_depth(parent.depth + 1)
            .with_cancel(parent.cancel.child_token());
        self.execute(state, ctx).await
    }

    #[tracing::instrument(
        name = "graph_run",
        skip(self, state, ctx),
        fields(graph = %self.graph.name, run_id = %ctx.run_id, depth = ctx.depth)
    )]
    async fn execute(&self, mut state: ExecutionState, ctx: RunContext) -> RunOutcome {
        let max_steps = self.config.max_steps;
        let mut path = Vec::new();
        let mut steps = 0usize;
        let mut current = self.entry.clone();

        info!(entry = %current, max_steps, "Starting run");

        loop {
            if ctx.is_cancelled() {
                warn!(node = %current, "Run cancelled");
                state
                    .errors
                    .push(ErrorRecord::cancelled(&current, "run cancelled before stage started"));
                break;
            }

            let Some(node) = self.graph.node(&current) else {
                error!(node = %current, "Node missing from compiled graph");
                state
                    .errors
                    .push(ErrorRecord::node_failure(&current, "node is not registered"));
                break;
            };

            path.push(current.clone());
            debug!(node = %current, step = steps, "Executing node");

            let step = match self.invoke_node(node, &state, &ctx).await {
                Ok(output) => {
                    state.apply(output);
                    self.next_after_success(&current, &mut state)
                }
                Err(err) => self.next_after_failure(node, err, &mut state),
            };

            let next = match step {
                Step::Goto(next) => next,
                Step::Stop => break,
            };

            if steps >= max_steps {
                error!(node = %current, max_steps, "Step budget exhausted");
                state
                    .errors
                    .push(ErrorRecord::routing_loop(&current, max_steps));
                break;
            }

            steps += 1;
            debug!(from = %current, to = %next, "Transition");
            current = next;
        }

        let success = match &self.success_predicate {
            Some(predicate) => predicate(&state),
            None => !state.has_errors(),
        };

        info!(
            success,
            steps,
            errors = state.errors.len(),
            last = %current,
            "Run finished"
        );

        RunOutcome {
            state,
            success,
            path,
            steps,
        }
    }

    fn next_after_success(&self, node: &str, state: &mut ExecutionState) -> Step {
        if self.graph.is_terminal(node) {
            return Step::Stop;
        }

        let Some(edge) = self.graph.outgoing(node) else {
            return Step::Stop;
        };

        match resolve_next(node, edge, state) {
            Ok(Transition::Next(next)) => Step::Goto(next),
            Ok(Transition::End) => Step::Stop,
            Err(record) => {
                error!(node = %node, error = %record, "Routing failed");
                state.errors.push(record);
                Step::Stop
            }
        }
    }

    fn next_after_failure(&self, node: &NodeSpec, err: StageError, state: &mut ExecutionState) -> Step {
        let record = ErrorRecord::from_stage_error(&node.name, &err);
        warn!(node = %node.name, kind = %record.kind, error = %err, "Stage failed");
        state.errors.push(record);

        if matches!(err, StageError::Cancelled) {
            return Step::Stop;
        }

        if let Some(target) = self.graph.error_edge(&node.name) {
            debug!(node = %node.name, target = %target, "Following error edge");
            return match Transition::to(target) {
                Transition::Next(next) => Step::Goto(next),
                Transition::End => Step::Stop,
            };
        }

        let policy = node.failure_policy.unwrap_or(self.config.failure_policy);
        match policy {
            FailurePolicy::Continue => {
                debug!(node = %node.name, "Continuing past failure");
                self.next_after_success(&node.name, state)
            }
            FailurePolicy::Halt => {
                error!(node = %node.name, "Halting run");
                Step::Stop
            }
        }
    }

    /// Invoke a node's stage, retrying per its policy
    async fn invoke_node(
        &self,
        node: &NodeSpec,
        state: &ExecutionState,
        ctx: &RunContext,
    ) -> Result<StageOutput, StageError> {
        let node_ctx = ctx.for_node(&node.name);
        let mut retry = RetryState::new();

        loop {
            let attempt = AssertUnwindSafe((node.stage)(state.derive())).catch_unwind();
            let result = match runtime::scope(node_ctx.clone(), attempt).await {
                Ok(result) => result,
                Err(panic) => Err(StageError::failed(format!(
                    "stage panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };

            let err = match result {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            let Some(policy) = node.retry.as_ref() else {
                return Err(err);
            };
            if !policy.is_retryable(&err) {
                return Err(err);
            }

            let last_error = retry.record_failure(err).clone();
            if !policy.should_retry(retry.attempts) {
                if retry.attempts > 1 {
                    warn!(
                        node = %node.name,
                        attempts = retry.attempts,
                        error = %last_error,
                        "Retries exhausted"
                    );
                }
                return Err(last_error);
            }

            let delay = policy.calculate_delay(retry.attempts - 1);
            warn!(
                node = %node.name,
                attempt = retry.attempts,
                max_attempts = policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %last_error,
                "Stage failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
            }
        }
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.graph.name)
            .field("entry", &self.entry)
            .field("nodes", &self.graph.order)
            .field("config", &self.config)
            .field("has_success_predicate", &self.success_predicate.is_some())
            .finish()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

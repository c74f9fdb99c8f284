//! Run context visible to stage functions while they execute
//!
//! The executor scopes a [`RunContext`] around every stage invocation using a
//! tokio task-local, so code running inside a stage can find out which run and
//! node it belongs to without the context being threaded through the stage
//! signature. The parallel dispatcher and the sub-workflow composer rely on it
//! to inherit cancellation, concurrency defaults and nesting depth.
//!
//! ```rust,ignore
//! use stagegraph_core::runtime;
//!
//! // Inside a stage function:
//! if let Some(ctx) = runtime::current() {
//!     tracing::info!(run_id = %ctx.run_id, node = %ctx.node, "working");
//!     if ctx.is_cancelled() {
//!         return Err(StageError::Cancelled);
//!     }
//! }
//! ```

use crate::config::ExecutionConfig;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

tokio::task_local! {
    static RUN_CONTEXT: RunContext;
}

/// Per-run information available inside a stage
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique id of the top-level run (shared by nested sub-workflows)
    pub run_id: Uuid,

    /// Name of the graph currently executing
    pub graph: String,

    /// Node whose stage is executing
    pub node: String,

    /// Cancellation signal for this run
    pub cancel: CancellationToken,

    /// Settings of the graph currently executing
    pub config: Arc<ExecutionConfig>,

    /// Sub-workflow nesting depth, 0 for a top-level run
    pub depth: usize,
}

impl RunContext {
    pub fn new(graph: impl Into<String>, config: Arc<ExecutionConfig>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            graph: graph.into(),
            node: String::new(),
            cancel: CancellationToken::new(),
            config,
            depth: 0,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Copy of this context pointing at `node`
    pub fn for_node(&self, node: &str) -> Self {
        Self {
            node: node.to_string(),
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Context of the stage running on the current task, if any
pub fn current() -> Option<RunContext> {
    RUN_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Run `future` with `ctx` as the current context
pub async fn scope<F>(ctx: RunContext, future: F) -> F::Output
where
    F: Future,
{
    RUN_CONTEXT.scope(ctx, future).await
}

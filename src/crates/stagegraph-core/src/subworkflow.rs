//! Nested workflows
//!
//! A [`SubworkflowStage`] is a stage whose work is an entire child graph. It
//! builds a derived sub-state from the parent's state, runs the child to
//! completion, and reports the child's outputs under a single output key of
//! the parent.
//!
//! ```text
//! parent state                        child run
//! ┌─────────────────────┐  derive   ┌───────────────────┐
//! │ task, context{a,b,c}│─────────► │ task, context{a}  │
//! │ outputs{...}        │           │ outputs{}         │
//! └─────────────────────┘           └───────────────────┘
//!           ▲                                 │
//!           │ outputs[key] = child.outputs    │ success
//!           └─────────────────────────────────┘
//! ```
//!
//! The child never touches the parent's state: on success the only parent key
//! that changes is `outputs[output_key]`. On failure the child's error log is
//! summarised into a single `SubworkflowFailure` record attributed to the
//! delegating node; the child's individual records stay inside the child.

use crate::error::{ErrorRecord, StageError};
use crate::executor::CompiledGraph;
use crate::graph::{StageFn, StageFuture};
use crate::runtime;
use crate::state::{ExecutionState, StageOutput, StateUpdate};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A stage that delegates to a nested graph
#[derive(Debug, Clone)]
pub struct SubworkflowStage {
    child: Arc<CompiledGraph>,
    output_key: String,
    context_keys: Option<BTreeSet<String>>,
    inherit_messages: bool,
}

impl SubworkflowStage {
    /// Run `child` and store its outputs under `outputs[output_key]`
    pub fn new(child: Arc<CompiledGraph>, output_key: impl Into<String>) -> Self {
        Self {
            child,
            output_key: output_key.into(),
            context_keys: None,
            inherit_messages: false,
        }
    }

    /// Only pass these context keys to the child (default: all of them)
    pub fn with_context_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Pass the parent's conversation log to the child
    pub fn with_inherit_messages(mut self, inherit: bool) -> Self {
        self.inherit_messages = inherit;
        self
    }

    pub fn child(&self) -> &CompiledGraph {
        &self.child
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// The state the child run starts from
    pub fn derive_sub_state(&self, parent: &ExecutionState) -> ExecutionState {
        let context = match &self.context_keys {
            Some(keys) => parent
                .context
                .iter()
                .filter(|(key, _)| keys.contains(key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            None => parent.context.clone(),
        };

        ExecutionState {
            messages: if self.inherit_messages {
                parent.messages.clone()
            } else {
                Vec::new()
            },
            current_task: parent.current_task.clone(),
            context,
            ..Default::default()
        }
    }

    /// Run the child graph against a sub-state of `state`
    pub async fn run(&self, state: &ExecutionState) -> Result<StageOutput, StageError> {
        let parent = runtime::current();
        let depth = parent.as_ref().map(|ctx| ctx.depth).unwrap_or(0);
        let max_depth = parent
            .as_ref()
            .map(|ctx| ctx.config.max_subworkflow_depth)
            .unwrap_or(self.child.config().max_subworkflow_depth);

        if depth >= max_depth {
            return Err(StageError::failed(format!(
                "sub-workflow '{}' would exceed the nesting limit of {}",
                self.child.name(),
                max_depth
            )));
        }

        let sub_state = self.derive_sub_state(state);
        debug!(child = %self.child.name(), depth = depth + 1, "Delegating to sub-workflow");

        let outcome = match &parent {
            Some(ctx) => self.child.run_nested(sub_state, ctx).await,
            None => self.child.run(sub_state).await,
        };

        if outcome.success {
            let mut value: Map<String, Value> = outcome.state.outputs.into_iter().collect();
            if !outcome.state.branch_results.is_empty() {
                let branches: Map<String, Value> =
                    outcome.state.branch_results.into_iter().collect();
                value.insert("branch_results".to_string(), Value::Object(branches));
            }
            return Ok(StateUpdate::new()
                .set_output(self.output_key.clone(), Value::Object(value))
                .into());
        }

        if parent.as_ref().is_some_and(|ctx| ctx.is_cancelled()) {
            return Err(StageError::Cancelled);
        }

        let summary = summarize(&outcome.state.errors);
        warn!(child = %self.child.name(), summary = %summary, "Sub-workflow failed");
        Err(StageError::Subworkflow {
            graph: self.child.name().to_string(),
            summary,
        })
    }

    pub fn into_stage(self) -> StageFn {
        let stage = Arc::new(self);
        Arc::new(move |state| -> StageFuture {
            let stage = stage.clone();
            Box::pin(async move { stage.run(&state).await })
        })
    }
}

/// One-line digest of a child's error log
pub fn summarize(errors: &[ErrorRecord]) -> String {
    match errors.first() {
        Some(first) => format!(
            "{} error(s); first: [{}] {}",
            errors.len(),
            first.node,
            first.message
        ),
        None => "run reported failure without recording errors".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StateGraph;
    use crate::config::ExecutionConfig;
    use serde_json::json;

    fn echo_child() -> Arc<CompiledGraph> {
        let mut graph = StateGraph::new("echo");
        graph
            .add_node_fn("echo", |state: ExecutionState| async move {
                let keys: Vec<Value> = state.context.keys().map(|k| json!(k)).collect();
                Ok(StateUpdate::new()
                    .set_output("task", json!(state.current_task))
                    .set_output("keys", Value::Array(keys))
                    .set_output("messages", json!(state.messages.len())))
            })
            .set_entry("echo")
            .add_terminal("echo");
        Arc::new(graph.compile().unwrap())
    }

    #[test]
    fn test_sub_state_filters_context() {
        let stage = SubworkflowStage::new(echo_child(), "echo").with_context_keys(["keep"]);
        let parent = ExecutionState::new()
            .with_task("write lines")
            .with_context("keep", json!(1))
            .with_context("drop", json!(2));

        let sub = stage.derive_sub_state(&parent);
        assert_eq!(sub.current_task.as_deref(), Some("write lines"));
        assert_eq!(sub.context.len(), 1);
        assert!(sub.messages.is_empty());
        assert!(sub.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_success_sets_only_output_key() {
        let stage = SubworkflowStage::new(echo_child(), "child")
            .with_context_keys(["keep"])
            .with_inherit_messages(true);
        let parent = ExecutionState::new()
            .with_task("t")
            .with_context("keep", json!(1))
            .with_context("drop", json!(2));

        let output = stage.run(&parent).await.unwrap();
        let mut after = parent.clone();
        after.apply(output);

        assert_eq!(after.context, parent.context);
        assert_eq!(after.messages, parent.messages);
        assert_eq!(after.outputs.len(), 1);
        assert_eq!(
            after.output("child"),
            Some(&json!({"keys": ["keep"], "messages": 1, "task": "t"}))
        );
    }

    #[tokio::test]
    async fn test_failure_is_summarised() {
        let mut graph = StateGraph::new("fragile");
        graph
            .add_node_fn("first", |_| async {
                Err::<StateUpdate, _>(StageError::failed("no outline"))
            })
            .set_entry("first")
            .add_terminal("first");
        let stage = SubworkflowStage::new(Arc::new(graph.compile().unwrap()), "out");

        let err = stage.run(&ExecutionState::new()).await.unwrap_err();
        assert_eq!(
            err,
            StageError::Subworkflow {
                graph: "fragile".to_string(),
                summary: "1 error(s); first: [first] no outline".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let stage = SubworkflowStage::new(echo_child(), "out");
        let ctx = runtime::RunContext::new(
            "parent",
            Arc::new(ExecutionConfig::default().with_max_subworkflow_depth(2)),
        )
        .with_depth(2);

        let err = runtime::scope(ctx, stage.run(&ExecutionState::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nesting limit of 2"));
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(
            summarize(&[]),
            "run reported failure without recording errors"
        );
    }
}

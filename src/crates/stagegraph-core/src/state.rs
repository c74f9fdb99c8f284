//! Execution state threaded through a run, and the partial updates stages return
//!
//! The [`ExecutionState`] is owned by the executor for the duration of one run.
//! Stage functions receive a snapshot and hand back a [`StageOutput`]: either a
//! full replacement state or, far more commonly, a [`StateUpdate`] naming only
//! the keys the stage intends to change. [`ExecutionState::apply`] is the single
//! merge point.
//!
//! # Merge Semantics
//!
//! ```text
//! state.context  = {a: 1, b: 2}
//! update.context = {b: 3, c: 4}
//! ─────────────────────────────── apply()
//! state.context  = {a: 1, b: 3, c: 4}
//! ```
//!
//! - Every key the update sets overwrites the prior value.
//! - Keys the update omits are preserved.
//! - `errors` is append-only: updates can push records, nothing removes them.
//!   A `Replace` output overwrites every field *except* `errors`.
//!
//! # Examples
//!
//! ```rust
//! use stagegraph_core::state::{ExecutionState, StateUpdate};
//! use serde_json::json;
//!
//! let mut state = ExecutionState::new()
//!     .with_task("make a platformer")
//!     .with_context("engine", json!("pygame"));
//!
//! state.apply(StateUpdate::new().set_output("title", json!("Sky Hopper")));
//!
//! assert_eq!(state.output("title"), Some(&json!("Sky Hopper")));
//! assert_eq!(state.context_value("engine"), Some(&json!("pygame")));
//! ```

use crate::error::ErrorRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Ordered key/value map used for context, outputs and branch results
///
/// A `BTreeMap` keeps iteration (and therefore serialization and join order)
/// deterministic.
pub type ValueMap = BTreeMap<String, Value>;

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Human,
    Assistant,
}

/// One entry of the conversation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Human, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// The mutable record threaded through a run
///
/// Child workflows and fan-out branches never share a reference to the
/// parent's state; they receive a [`derive`](Self::derive)d copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Conversation log
    #[serde(default)]
    pub messages: Vec<Message>,

    /// The task currently being worked on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,

    /// Arbitrary working context
    #[serde(default)]
    pub context: ValueMap,

    /// Named results produced by stages
    #[serde(default)]
    pub outputs: ValueMap,

    /// Joined fan-out results, one key per dispatched branch
    #[serde(default)]
    pub branch_results: ValueMap,

    /// Accumulated failures, append-only
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current task and seed the conversation with it
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        let task = task.into();
        self.messages.push(Message::human(task.clone()));
        self.current_task = Some(task);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    pub fn branch_result(&self, branch: &str) -> Option<&Value> {
        self.branch_results.get(branch)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Copy handed to a fan-out branch or nested workflow
    ///
    /// The copy is fully independent: mutations made through it are invisible
    /// to the original and to sibling copies.
    pub fn derive(&self) -> Self {
        self.clone()
    }

    /// Merge a stage's output into this state
    pub fn apply(&mut self, output: impl Into<StageOutput>) {
        match output.into() {
            StageOutput::Replace(replacement) => {
                let errors = std::mem::take(&mut self.errors);
                *self = ExecutionState {
                    errors,
                    ..replacement
                };
            }
            StageOutput::Update(update) => self.apply_update(update),
        }
    }

    fn apply_update(&mut self, update: StateUpdate) {
        if let Some(messages) = update.messages {
            self.messages = messages;
        }
        self.messages.extend(update.append_messages);

        if let Some(task) = update.current_task {
            self.current_task = task;
        }

        self.context.extend(update.context);
        self.outputs.extend(update.outputs);
        self.branch_results.extend(update.branch_results);
        self.errors.extend(update.errors);
    }

    /// Caller-facing view of the state
    pub fn into_result(self, success: bool) -> RunResult {
        RunResult {
            success,
            outputs: self.outputs,
            branch_results: self.branch_results,
            errors: self.errors,
        }
    }
}

/// Partial update returned by a stage
///
/// Only the fields a stage touches are carried; everything else in the state
/// is left alone when the update is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub(crate) messages: Option<Vec<Message>>,
    pub(crate) append_messages: Vec<Message>,
    pub(crate) current_task: Option<Option<String>>,
    pub(crate) context: ValueMap,
    pub(crate) outputs: ValueMap,
    pub(crate) branch_results: ValueMap,
    pub(crate) errors: Vec<ErrorRecord>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn set_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn set_branch_result(mut self, branch: impl Into<String>, value: Value) -> Self {
        self.branch_results.insert(branch.into(), value);
        self
    }

    pub fn append_message(mut self, message: Message) -> Self {
        self.append_messages.push(message);
        self
    }

    /// Replace the whole conversation log (appended messages still follow)
    pub fn replace_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn set_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(Some(task.into()));
        self
    }

    pub fn clear_task(mut self) -> Self {
        self.current_task = Some(None);
        self
    }

    pub fn push_error(mut self, record: ErrorRecord) -> Self {
        self.errors.push(record);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &StateUpdate::default()
    }

    pub fn outputs(&self) -> &ValueMap {
        &self.outputs
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }
}

/// What a stage hands back to the executor
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Replace the state wholesale (the error log is kept)
    Replace(ExecutionState),
    /// Merge the named keys into the state
    Update(StateUpdate),
}

impl From<ExecutionState> for StageOutput {
    fn from(state: ExecutionState) -> Self {
        StageOutput::Replace(state)
    }
}

impl From<StateUpdate> for StageOutput {
    fn from(update: StateUpdate) -> Self {
        StageOutput::Update(update)
    }
}

/// Result exposed to callers once a run has finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub outputs: ValueMap,
    pub branch_results: ValueMap,
    pub errors: Vec<ErrorRecord>,
}

//! Conditional routing
//!
//! A conditional edge pairs a [`Router`] with a label → target table. The
//! router is a pure function of the current [`ExecutionState`]; the executor
//! calls it on the state *after* the source node's update has been merged and
//! looks the returned label up in the table.
//!
//! ```text
//!                    router(state) = "ready"
//!            ┌──────────┐ ─────────────────────► ┌─────────┐
//!            │ analyze  │                        │ build   │
//!            └──────────┘ ─────────────────────► └─────────┘
//!                    router(state) = "incomplete"   ┌─────────┐
//!                                               └─► │ clarify │
//!                                                   └─────────┘
//! ```
//!
//! A label with no entry in the table is never resolved to a default: it is
//! reported as an `UnknownRoute` failure and the run stops.
//!
//! # Examples
//!
//! ```rust
//! use stagegraph_core::router::Router;
//! use stagegraph_core::state::ExecutionState;
//! use serde_json::json;
//!
//! let router = Router::new(|state: &ExecutionState| {
//!     match state.context_value("complete").and_then(|v| v.as_bool()) {
//!         Some(true) => "ready".to_string(),
//!         _ => "incomplete".to_string(),
//!     }
//! })
//! .with_labels(["ready", "incomplete"]);
//!
//! let state = ExecutionState::new().with_context("complete", json!(true));
//! assert_eq!(router.route(&state), "ready");
//! ```

use crate::error::ErrorRecord;
use crate::graph::{Edge, NodeId, END};
use crate::state::ExecutionState;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Router function signature
pub type RouteFn = Arc<dyn Fn(&ExecutionState) -> String + Send + Sync>;

/// Label-producing function attached to a conditional edge
#[derive(Clone)]
pub struct Router {
    func: RouteFn,
    labels: Option<BTreeSet<String>>,
}

impl Router {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&ExecutionState) -> String + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            labels: None,
        }
    }

    /// Route on a string value in the state's context
    ///
    /// Missing or non-string values produce the label `default`.
    pub fn from_context(key: impl Into<String>, default: impl Into<String>) -> Self {
        let key = key.into();
        let default = default.into();
        Self::new(move |state| {
            state
                .context_value(&key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| default.clone())
        })
    }

    /// Declare every label this router can return
    ///
    /// When declared, graph validation checks that each label has a branch.
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn labels(&self) -> Option<&BTreeSet<String>> {
        self.labels.as_ref()
    }

    /// Evaluate the router against `state`
    pub fn route(&self, state: &ExecutionState) -> String {
        (self.func)(state)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("func", &"<function>")
            .field("labels", &self.labels)
            .finish()
    }
}

/// Where the executor goes after a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(NodeId),
    End,
}

impl Transition {
    pub(crate) fn to(target: &str) -> Self {
        if target == END {
            Transition::End
        } else {
            Transition::Next(target.to_string())
        }
    }
}

/// Look up the branch for `label`
pub fn select_branch(
    node: &str,
    label: &str,
    branches: &BTreeMap<String, NodeId>,
) -> Result<Transition, ErrorRecord> {
    branches
        .get(label)
        .map(|target| Transition::to(target))
        .ok_or_else(|| ErrorRecord::unknown_route(node, label))
}

/// Resolve the transition out of `node` through its outgoing `edge`
pub fn resolve_next(
    node: &str,
    edge: &Edge,
    state: &ExecutionState,
) -> Result<Transition, ErrorRecord> {
    match edge {
        Edge::Static { to, .. } => Ok(Transition::to(to)),
        Edge::Conditional {
            router, branches, ..
        } => {
            let label = router.route(state);
            tracing::debug!(node = %node, label = %label, "Router selected label");
            select_branch(node, &label, branches)
        }
    }
}

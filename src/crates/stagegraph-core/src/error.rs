//! Error types for graph definition and graph execution
//!
//! Two distinct families live here and they never mix:
//!
//! - [`GraphError`] is returned by *definition-time* operations: compiling a
//!   graph, loading a YAML definition, parsing configuration. These are
//!   programmer errors and fail fast.
//! - [`StageError`] is what a stage function returns when its work fails. The
//!   executor converts every `StageError` into an [`ErrorRecord`] appended to
//!   the run's error log; it is never thrown across the executor boundary.
//!
//! # Error Taxonomy
//!
//! ```text
//! ErrorKind
//! ├── NodeFailure         - a stage returned an error
//! ├── UnknownRoute        - a router produced a label with no branch
//! ├── RoutingLoop         - the step budget was exhausted
//! ├── BranchFailure       - a fan-out branch failed
//! ├── SubworkflowFailure  - a delegated child graph failed
//! └── Cancelled           - the run or a branch was cancelled
//! ```
//!
//! # Examples
//!
//! ```rust
//! use stagegraph_core::error::{ErrorKind, ErrorRecord};
//!
//! let record = ErrorRecord::node_failure("render", "model returned nothing");
//! assert_eq!(record.kind, ErrorKind::NodeFailure);
//! assert!(record.branch.is_none());
//!
//! let tagged = ErrorRecord::branch_failure("fanout", "audio", "timed out");
//! assert_eq!(tagged.branch.as_deref(), Some("audio"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Definition-time and configuration errors
///
/// Returned when a graph is compiled, a declarative definition is loaded or a
/// configuration file is parsed. Run-time stage failures are reported as
/// [`ErrorRecord`]s instead.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure is invalid
    ///
    /// **Common causes**:
    /// - Missing entry node
    /// - Edge referencing a node that was never added
    /// - Node unreachable from the entry
    /// - Router label with no declared branch
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// The same node name was registered twice
    #[error("Duplicate node name: '{0}'")]
    DuplicateNode(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O failure while reading a definition or config file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML graph definition could not be parsed
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML configuration could not be parsed
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// Shorthand for a [`GraphError::Validation`] error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Failure returned by a stage function
///
/// Stage functions return `Result<StageOutput, StageError>`. The executor maps
/// each variant onto an [`ErrorKind`] when it records the failure:
///
/// | `StageError`    | recorded as                        |
/// |-----------------|------------------------------------|
/// | `Generation`    | [`ErrorKind::NodeFailure`]         |
/// | `Failed`        | [`ErrorKind::NodeFailure`]         |
/// | `Subworkflow`   | [`ErrorKind::SubworkflowFailure`]  |
/// | `Cancelled`     | [`ErrorKind::Cancelled`]           |
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// The external generation service reported a failure
    #[error("generation failed ({kind}): {message}")]
    Generation {
        /// Collaborator-defined failure category (e.g. `rate_limited`)
        kind: String,
        /// Human readable description
        message: String,
    },

    /// Generic stage failure
    #[error("{0}")]
    Failed(String),

    /// A nested workflow finished unsuccessfully
    #[error("subworkflow '{graph}' failed: {summary}")]
    Subworkflow {
        /// Name of the child graph
        graph: String,
        /// One-line summary of the child's error log
        summary: String,
    },

    /// Work was abandoned because the run was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// Create a generic failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create a generation failure
    pub fn generation(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generation {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The kind under which the executor records this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Generation { .. } | StageError::Failed(_) => ErrorKind::NodeFailure,
            StageError::Subworkflow { .. } => ErrorKind::SubworkflowFailure,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Category of a recorded run-time failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NodeFailure,
    UnknownRoute,
    RoutingLoop,
    BranchFailure,
    SubworkflowFailure,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NodeFailure => "node_failure",
            ErrorKind::UnknownRoute => "unknown_route",
            ErrorKind::RoutingLoop => "routing_loop",
            ErrorKind::BranchFailure => "branch_failure",
            ErrorKind::SubworkflowFailure => "subworkflow_failure",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One entry of a run's error log
///
/// Appended by the executor (or by the join step of a fan-out) and never
/// removed during a run. Callers inspect the log after the run to decide
/// overall success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Node that was executing when the failure happened
    pub node: String,

    /// Failure category
    pub kind: ErrorKind,

    /// Human readable description
    pub message: String,

    /// Fan-out branch the failure belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl ErrorRecord {
    pub fn new(node: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            kind,
            message: message.into(),
            branch: None,
        }
    }

    pub fn node_failure(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(node, ErrorKind::NodeFailure, message)
    }

    pub fn unknown_route(node: impl Into<String>, label: &str) -> Self {
        Self::new(
            node,
            ErrorKind::UnknownRoute,
            format!("router returned unknown label '{}'", label),
        )
    }

    pub fn routing_loop(node: impl Into<String>, max_steps: usize) -> Self {
        Self::new(
            node,
            ErrorKind::RoutingLoop,
            format!("step budget of {} transitions exhausted", max_steps),
        )
    }

    pub fn branch_failure(
        node: impl Into<String>,
        branch: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(node, ErrorKind::BranchFailure, message).with_branch(branch)
    }

    pub fn subworkflow_failure(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(node, ErrorKind::SubworkflowFailure, message)
    }

    pub fn cancelled(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(node, ErrorKind::Cancelled, message)
    }

    /// Convert a stage failure into a record attributed to `node`
    pub fn from_stage_error(node: impl Into<String>, error: &StageError) -> Self {
        Self::new(node, error.kind(), error.to_string())
    }

    /// Tag the record with the fan-out branch it came from
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.branch {
            Some(branch) => write!(
                f,
                "[{}/{}] {}: {}",
                self.node, branch, self.kind, self.message
            ),
            None => write!(f, "[{}] {}: {}", self.node, self.kind, self.message),
        }
    }
}

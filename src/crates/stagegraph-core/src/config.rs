//! Execution settings applied to every run of a compiled graph

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the executor does after recording a stage failure when the node has
/// no error edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run at the failing node
    #[default]
    Halt,
    /// Follow the node's regular outgoing edge as if it had succeeded
    Continue,
}

/// Run-wide limits and policies
///
/// All fields have defaults, so a partial TOML table is enough:
///
/// ```toml
/// max_steps = 50
/// failure_policy = "continue"
/// max_concurrency = 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum node transitions before a run is stopped as a routing loop
    pub max_steps: usize,

    /// Graph-wide failure policy (nodes may override it)
    pub failure_policy: FailurePolicy,

    /// Default bound on simultaneously running fan-out branches
    pub max_concurrency: Option<usize>,

    /// Deadline for a single fan-out branch, in milliseconds
    pub branch_timeout_ms: Option<u64>,

    /// How deeply sub-workflows may nest
    pub max_subworkflow_depth: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            failure_policy: FailurePolicy::Halt,
            max_concurrency: None,
            branch_timeout_ms: None,
            max_subworkflow_depth: default_max_subworkflow_depth(),
        }
    }
}

fn default_max_steps() -> usize {
    100
}

fn default_max_subworkflow_depth() -> usize {
    8
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_subworkflow_depth(mut self, depth: usize) -> Self {
        self.max_subworkflow_depth = depth;
        self
    }

    pub fn branch_timeout(&self) -> Option<Duration> {
        self.branch_timeout_ms.map(Duration::from_millis)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ExecutionConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded execution config");
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(GraphError::Configuration(
                "max_steps must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(GraphError::Configuration(
                "max_concurrency must be greater than zero when set".to_string(),
            ));
        }
        if self.max_subworkflow_depth == 0 {
            return Err(GraphError::Configuration(
                "max_subworkflow_depth must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.max_steps, 100);
        assert_eq!(config.failure_policy, FailurePolicy::Halt);
        assert!(config.max_concurrency.is_none());
        assert!(config.branch_timeout().is_none());
        assert_eq!(config.max_subworkflow_depth, 8);
    }

    #[test]
    fn test_partial_toml() {
        let config = ExecutionConfig::from_toml_str(
            r#"
            max_steps = 25
            failure_policy = "continue"
            branch_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.max_steps, 25);
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.branch_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.max_subworkflow_depth, 8);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ExecutionConfig::from_toml_str("max_steps = 0").unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));

        let err = ExecutionConfig::from_toml_str("max_concurrency = 0").unwrap_err();
        assert!(matches!(err, GraphError::Configuration(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = ExecutionConfig::from_toml_str("failure_policy = \"explode\"").unwrap_err();
        assert!(matches!(err, GraphError::Toml(_)));
    }

    #[test]
    fn test_builder() {
        let config = ExecutionConfig::new()
            .with_max_steps(10)
            .with_max_concurrency(2)
            .with_branch_timeout(Duration::from_secs(3));

        assert_eq!(config.max_steps, 10);
        assert_eq!(config.max_concurrency, Some(2));
        assert_eq!(config.branch_timeout_ms, Some(3000));
    }
}

//! Pipeline configuration
//!
//! Loaded from a TOML file; every section and field is optional.
//!
//! ```toml
//! [execution]
//! max_steps = 50
//! max_concurrency = 4
//! branch_timeout_ms = 120000
//!
//! [logging]
//! level = "debug"
//! format = "pretty"
//!
//! [pipeline]
//! completeness_threshold = 0.8
//! max_revisions = 2
//! default_engine = "pygame"
//! categories = ["code", "graphics", "audio", "dialogue", "quests"]
//! ```
//!
//! After parsing, environment overrides are applied:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STAGEGRAPH_MAX_STEPS` | `execution.max_steps` |
//! | `STAGEGRAPH_MAX_CONCURRENCY` | `execution.max_concurrency` |
//! | `STAGEGRAPH_LOG_LEVEL` | `logging.level` |

use crate::error::{PrebuiltError, Result};
use serde::{Deserialize, Serialize};
use stagegraph_core::{ExecutionConfig, RetryPolicy};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Engines the pipeline can target
pub const SUPPORTED_ENGINES: [&str; 3] = ["pygame", "godot", "bevy"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

/// Content categories produced by the fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Code,
    Graphics,
    Audio,
    Dialogue,
    Quests,
}

impl ContentCategory {
    pub const ALL: [ContentCategory; 5] = [
        ContentCategory::Code,
        ContentCategory::Graphics,
        ContentCategory::Audio,
        ContentCategory::Dialogue,
        ContentCategory::Quests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Code => "code",
            ContentCategory::Graphics => "graphics",
            ContentCategory::Audio => "audio",
            ContentCategory::Dialogue => "dialogue",
            ContentCategory::Quests => "quests",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for the content pipeline's routing and fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Analysis scores strictly above this skip specification generation
    pub completeness_threshold: f64,

    /// Revision rounds allowed before a review counts as rejected
    pub max_revisions: usize,

    /// Engine used when neither the analysis nor the specification names one
    pub default_engine: String,

    /// Branches dispatched by the content fan-out
    pub categories: Vec<ContentCategory>,

    /// Retry policy for generation stages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            completeness_threshold: 0.8,
            max_revisions: 2,
            default_engine: "pygame".to_string(),
            categories: ContentCategory::ALL.to_vec(),
            retry: Some(RetryPolicy::new(2)),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.completeness_threshold) {
            return Err(PrebuiltError::config(format!(
                "completeness_threshold must be within 0.0..=1.0, got {}",
                self.completeness_threshold
            )));
        }
        if !SUPPORTED_ENGINES.contains(&self.default_engine.as_str()) {
            return Err(PrebuiltError::config(format!(
                "unsupported default_engine '{}'",
                self.default_engine
            )));
        }
        if self.categories.is_empty() {
            return Err(PrebuiltError::config("at least one content category is required"));
        }
        let mut seen = self.categories.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.categories.len() {
            return Err(PrebuiltError::config("content categories must be unique"));
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Full,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "stagegraph_core=debug"
    pub level: String,
    pub format: LogFormat,
    /// Enable colored output
    pub colored: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            colored: true,
        }
    }
}

impl AppConfig {
    /// Read `path`, apply environment overrides and validate
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        debug!(path = %path.display(), "Read configuration file");

        let mut config: AppConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;

        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate without consulting the environment
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.execution.validate()?;
        self.pipeline.validate()
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("STAGEGRAPH_MAX_STEPS") {
            self.execution.max_steps = parse_number("STAGEGRAPH_MAX_STEPS", &value)?;
        }
        if let Some(value) = lookup("STAGEGRAPH_MAX_CONCURRENCY") {
            self.execution.max_concurrency = Some(parse_number("STAGEGRAPH_MAX_CONCURRENCY", &value)?);
        }
        if let Some(value) = lookup("STAGEGRAPH_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        PrebuiltError::config(format!("{} must be a positive integer, got '{}'", key, value))
    })
}

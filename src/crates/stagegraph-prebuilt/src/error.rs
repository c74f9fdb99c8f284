//! Error Types - Pipeline Construction and Configuration Errors
//!
//! Errors returned while assembling the content pipeline or loading its
//! configuration. Failures that happen *during* a run never surface here:
//! they are recorded in the run's error log by the executor.
//!
//! # Error Categories
//!
//! - **Graph Errors** - the underlying graph failed to compile
//! - **Config Errors** - invalid settings or logging setup
//! - **Parse Errors** - TOML or JSON that could not be read

use thiserror::Error;

/// Result type for prebuilt operations
pub type Result<T> = std::result::Result<T, PrebuiltError>;

/// Errors that can occur while building or configuring the pipeline
#[derive(Error, Debug)]
pub enum PrebuiltError {
    /// Graph construction or validation error
    #[error("Graph error: {0}")]
    Graph(#[from] stagegraph_core::GraphError),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading a configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid TOML
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PrebuiltError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

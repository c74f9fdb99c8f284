//! # stagegraph-prebuilt - Game Content Pipeline
//!
//! A ready-made multi-stage content pipeline on top of
//! [`stagegraph_core`]. Given a free-form game request it analyses the
//! request, optionally seeds and writes a game specification, asks for a
//! review, and then generates code, graphics, audio, dialogue and quests
//! concurrently.
//!
//! - **[Content Pipeline](orchestrator)** - the master workflow
//! - **[Sub-workflows](content)** - dialogue and quest child graphs
//! - **[Generation](generation)** - the external content service seam
//! - **[Configuration](config)** and **[logging](logging)**
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stagegraph_prebuilt::{init_logging, AppConfig, ContentPipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> stagegraph_prebuilt::Result<()> {
//!     let config = AppConfig::load("stagegraph.toml").await?;
//!     init_logging(&config.logging)?;
//!
//!     let pipeline = ContentPipeline::new(Arc::new(MyModelClient::new()), config)?;
//!     let result = pipeline.generate("a cozy farming game in godot").await;
//!
//!     for error in &result.errors {
//!         eprintln!("{}", error);
//!     }
//!     println!("{}", serde_json::to_string_pretty(&result.outputs)?);
//!     Ok(())
//! }
//! ```
//!
//! Run results follow the core crate's contract: the pipeline never returns
//! an error once built. Failed categories show up as `null` entries in
//! `branch_results` plus one tagged record each in `errors`.

pub mod config;
pub mod content;
pub mod error;
pub mod game_spec;
pub mod generation;
pub mod logging;
pub mod orchestrator;
pub mod prompts;
pub mod review;
pub mod stages;

pub use config::{AppConfig, ContentCategory, LogFormat, LoggingConfig, PipelineConfig};
pub use content::{dialogue_workflow, quest_workflow};
pub use error::{PrebuiltError, Result};
pub use game_spec::{AnalysisReport, GameSpec};
pub use generation::{Content, GenerationError, GenerationErrorKind, GenerationService, ScriptedGenerator};
pub use logging::init_logging;
pub use orchestrator::{ContentPipeline, ContentPipelineBuilder};
pub use review::{AutoApprove, ReviewDecision, SpecReviewer};
pub use stages::{generate_stage, PromptSpec};

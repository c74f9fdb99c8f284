//! Generation Service - The External Content Collaborator
//!
//! Every stage that produces text (analysis, specifications, code, dialogue)
//! goes through a [`GenerationService`]. The pipeline never talks to a model
//! provider directly, so a deployment plugs in its own client and tests plug
//! in a [`ScriptedGenerator`].
//!
//! # Implementing a Service
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use stagegraph_prebuilt::{Content, GenerationError, GenerationService};
//!
//! struct MyClient { /* http client, api key, ... */ }
//!
//! #[async_trait]
//! impl GenerationService for MyClient {
//!     async fn generate(
//!         &self,
//!         prompt: &str,
//!         context: &serde_json::Map<String, serde_json::Value>,
//!     ) -> Result<Content, GenerationError> {
//!         let text = self.complete(prompt, context).await
//!             .map_err(|e| GenerationError::unavailable(e.to_string()))?;
//!         Ok(Content::text(text))
//!     }
//! }
//! ```
//!
//! # Scripted Replies
//!
//! [`ScriptedGenerator`] answers prompts by prefix. Several replies queued
//! for the same prefix are served in order; the last one repeats.
//!
//! ```rust
//! use stagegraph_prebuilt::{Content, GenerationService, ScriptedGenerator};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let generator = ScriptedGenerator::new()
//!     .on_prefix("Outline", Content::text("three beats"))
//!     .with_fallback(Content::text("..."));
//!
//! let reply = generator.generate("Outline the quest", &Default::default()).await.unwrap();
//! assert_eq!(reply.text, "three beats");
//! assert_eq!(generator.prompts().await, vec!["Outline the quest"]);
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stagegraph_core::StageError;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

/// Produces content for a prompt
///
/// `context` carries the state values the calling stage selected as inputs,
/// for services that send structured context alongside the prompt.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        context: &Map<String, Value>,
    ) -> Result<Content, GenerationError>;
}

/// A generated piece of content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub text: String,

    /// Provider details (model, token counts, ...)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Failure category reported by a generation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    RateLimited,
    InvalidResponse,
    Unavailable,
    Other,
}

impl fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationErrorKind::RateLimited => "rate_limited",
            GenerationErrorKind::InvalidResponse => "invalid_response",
            GenerationErrorKind::Unavailable => "unavailable",
            GenerationErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`GenerationService`]
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::RateLimited, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::InvalidResponse, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Unavailable, message)
    }
}

impl From<GenerationError> for StageError {
    fn from(err: GenerationError) -> Self {
        StageError::generation(err.kind.to_string(), err.message)
    }
}

type ScriptedReply = Result<Content, GenerationError>;

struct ScriptedRule {
    prefix: String,
    replies: VecDeque<ScriptedReply>,
}

/// Deterministic offline [`GenerationService`]
///
/// Used for dry runs and tests. Every prompt it receives is recorded.
pub struct ScriptedGenerator {
    rules: Mutex<Vec<ScriptedRule>>,
    fallback: Option<Content>,
    latency: Option<Duration>,
    served: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            fallback: None,
            latency: None,
            served: Mutex::new(Vec::new()),
        }
    }

    /// Answer prompts starting with `prefix` with `content`
    pub fn on_prefix(self, prefix: impl Into<String>, content: Content) -> Self {
        self.push_reply(prefix.into(), Ok(content))
    }

    /// Fail prompts starting with `prefix` with `error`
    pub fn fail_on_prefix(self, prefix: impl Into<String>, error: GenerationError) -> Self {
        self.push_reply(prefix.into(), Err(error))
    }

    /// Reply used when no prefix matches
    pub fn with_fallback(mut self, content: Content) -> Self {
        self.fallback = Some(content);
        self
    }

    /// Sleep this long before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn push_reply(mut self, prefix: String, reply: ScriptedReply) -> Self {
        let rules = self.rules.get_mut();
        match rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(ScriptedRule {
                prefix,
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    /// Prompts served so far, in arrival order
    pub async fn prompts(&self) -> Vec<String> {
        self.served.lock().await.clone()
    }

    /// Number of served prompts starting with `prefix`
    pub async fn count_prefix(&self, prefix: &str) -> usize {
        self.served
            .lock()
            .await
            .iter()
            .filter(|prompt| prompt.starts_with(prefix))
            .count()
    }
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScriptedGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedGenerator")
            .field("fallback", &self.fallback)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _context: &Map<String, Value>,
    ) -> Result<Content, GenerationError> {
        self.served.lock().await.push(prompt.to_string());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let reply = {
            let mut rules = self.rules.lock().await;
            rules
                .iter_mut()
                .find(|rule| prompt.starts_with(&rule.prefix))
                .and_then(|rule| {
                    if rule.replies.len() > 1 {
                        rule.replies.pop_front()
                    } else {
                        rule.replies.front().cloned()
                    }
                })
        };

        trace!(matched = reply.is_some(), "Scripted generation");
        match reply {
            Some(reply) => reply,
            None => self.fallback.clone().ok_or_else(|| {
                GenerationError::invalid_response(format!(
                    "no scripted reply for prompt '{}'",
                    prompt.lines().next().unwrap_or_default()
                ))
            }),
        }
    }
}

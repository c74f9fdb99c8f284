//! Specification review
//!
//! The pipeline pauses at `human_review` and asks a [`SpecReviewer`] what to
//! do with the generated game specification. [`AutoApprove`] accepts every
//! specification; an interactive front end supplies its own reviewer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of reviewing a specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "feedback", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    /// Regenerate the specification with this feedback
    NeedsRevision(String),
    Rejected(String),
}

impl ReviewDecision {
    /// Routing label for this decision
    pub fn label(&self) -> &'static str {
        match self {
            ReviewDecision::Approved => "approved",
            ReviewDecision::NeedsRevision(_) => "needs_revision",
            ReviewDecision::Rejected(_) => "rejected",
        }
    }

    pub fn feedback(&self) -> Option<&str> {
        match self {
            ReviewDecision::Approved => None,
            ReviewDecision::NeedsRevision(text) | ReviewDecision::Rejected(text) => Some(text),
        }
    }
}

#[async_trait]
pub trait SpecReviewer: Send + Sync {
    /// `revision` is the number of revisions already requested in this run
    async fn review(&self, spec: &Value, revision: usize) -> ReviewDecision;
}

/// Approves every specification
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl SpecReviewer for AutoApprove {
    async fn review(&self, _spec: &Value, _revision: usize) -> ReviewDecision {
        ReviewDecision::Approved
    }
}

//! Parsing of generated JSON replies
//!
//! Generation services are asked for JSON but often wrap it in prose or code
//! fences. [`extract_json`] pulls the outermost object out of such a reply;
//! the parsers below fall back to conservative defaults when that fails.

use crate::config::SUPPORTED_ENGINES;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Structured result of the input analysis stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisReport {
    pub input_type: String,
    pub detected_engine: Option<String>,
    pub completeness_score: f64,
    pub needs_seeding: bool,
    pub missing_information: Vec<String>,
    pub suggested_processing: Option<String>,
    /// False when the reply could not be parsed and defaults were used
    #[serde(skip_deserializing)]
    pub parsed: bool,
}

impl Default for AnalysisReport {
    fn default() -> Self {
        Self {
            input_type: "prompt".to_string(),
            detected_engine: None,
            completeness_score: 0.0,
            needs_seeding: false,
            missing_information: Vec::new(),
            suggested_processing: None,
            parsed: false,
        }
    }
}

impl AnalysisReport {
    /// Parse an analysis reply; malformed replies yield the defaults, which
    /// route to specification generation
    pub fn parse(reply: &str) -> Self {
        match extract_json(reply).and_then(|value| serde_json::from_value::<AnalysisReport>(value).ok()) {
            Some(mut report) => {
                report.parsed = true;
                report.completeness_score = report.completeness_score.clamp(0.0, 1.0);
                report.detected_engine = report.detected_engine.and_then(|engine| normalize_engine(&engine));
                if report.suggested_processing.as_deref() == Some("seeding_first") {
                    report.needs_seeding = true;
                }
                report
            }
            None => {
                warn!("Analysis reply was not valid JSON, falling back to defaults");
                Self::default()
            }
        }
    }
}

/// A generated game specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSpec {
    pub title: String,
    pub description: String,
    pub engine: String,
    pub genre: String,
    pub target_audience: String,
    pub features: Vec<String>,
    pub art_style: String,
    pub complexity: String,
    pub assets_needed: Vec<String>,
    pub code_requirements: Vec<String>,
}

impl Default for GameSpec {
    fn default() -> Self {
        Self {
            title: "Generated Game".to_string(),
            description: String::new(),
            engine: "pygame".to_string(),
            genre: "adventure".to_string(),
            target_audience: "all".to_string(),
            features: Vec::new(),
            art_style: "modern".to_string(),
            complexity: "intermediate".to_string(),
            assets_needed: Vec::new(),
            code_requirements: Vec::new(),
        }
    }
}

impl GameSpec {
    /// Minimal specification built from the request alone
    pub fn fallback(request: &str, engine: &str) -> Self {
        Self {
            description: request.to_string(),
            engine: engine.to_string(),
            ..Default::default()
        }
    }

    /// Parse a specification reply
    ///
    /// Unknown engines are replaced by `engine` and unknown complexity levels
    /// by "intermediate"; an unparseable reply yields [`GameSpec::fallback`].
    pub fn parse(reply: &str, request: &str, engine: &str) -> Self {
        let Some(mut spec) = extract_json(reply).and_then(|value| serde_json::from_value::<GameSpec>(value).ok())
        else {
            warn!("Specification reply was not valid JSON, using a fallback specification");
            return Self::fallback(request, engine);
        };

        spec.engine = normalize_engine(&spec.engine).unwrap_or_else(|| engine.to_string());
        if !["simple", "intermediate", "complex"].contains(&spec.complexity.as_str()) {
            spec.complexity = "intermediate".to_string();
        }
        spec
    }
}

/// Lower-cased engine name if it is supported
pub fn normalize_engine(engine: &str) -> Option<String> {
    let engine = engine.trim().to_lowercase();
    SUPPORTED_ENGINES.contains(&engine.as_str()).then_some(engine)
}

/// The outermost JSON object in `reply`
pub fn extract_json(reply: &str) -> Option<Value> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end])
        .ok()
        .filter(Value::is_object)
}

//! Content Pipeline - The Master Game Content Workflow
//!
//! Turns a free-form game request into generated content by routing it
//! through analysis, optional seeding, specification and review, then fanning
//! out to every content category at once.
//!
//! # Architecture
//!
//! ```text
//!                    ┌────────────────┐
//!                    │ input_analysis │
//!                    └───────┬────────┘
//!     needs_seeding ┌────────┼──────────────────┐ has_complete_spec
//!                   ↓        │ needs_spec_      │
//!             ┌─────────┐    │ generation       │
//!             │ seeding │    │                  │
//!             └────┬────┘    ↓                  │
//!                  └──► ┌─────────────────┐ ◄─┐ │
//!                       │ spec_generation │   │ │ needs_revision
//!                       └────────┬────────┘   │ │
//!                                ↓            │ │
//!                       ┌─────────────────┐ ──┘ │
//!                       │  human_review   │ ── rejected ──► END
//!                       └────────┬────────┘     │
//!                                ↓ approved     │
//!                       ┌─────────────────┐ ◄───┘
//!                       │ engine_routing  │
//!                       └────────┬────────┘
//!                                ↓
//!             ┌──────────── content_generation ────────────┐
//!             │  code │ graphics │ audio │ dialogue* │ quests* │
//!             └────────────────────┬───────────────────────┘
//!                                  ↓
//!                       ┌────────────────────┐
//!                       │ result_compilation │
//!                       └────────────────────┘
//!
//!   * nested sub-workflows, see [`crate::content`]
//! ```
//!
//! # Routing
//!
//! | After | Label | Condition |
//! |-------|-------|-----------|
//! | `input_analysis` | `needs_seeding` | analysis asked for seeding |
//! | `input_analysis` | `has_complete_spec` | completeness score above the threshold |
//! | `input_analysis` | `needs_spec_generation` | otherwise, including malformed replies |
//! | `human_review` | `approved` / `needs_revision` / `rejected` | reviewer decision |
//!
//! Revision requests beyond `max_revisions` count as a rejection, so the
//! review loop always ends.
//!
//! # Quick Start
//!
//! ```rust
//! use stagegraph_prebuilt::{prompts, Content, ContentPipeline, ScriptedGenerator};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(
//!     ScriptedGenerator::new()
//!         .on_prefix(prompts::ANALYSIS, Content::text(r#"{"completeness_score": 0.95}"#))
//!         .with_fallback(Content::text("generated")),
//! );
//!
//! let pipeline = ContentPipeline::builder(service).build()?;
//! let result = pipeline.generate("a pygame asteroids clone").await;
//!
//! assert!(result.success);
//! assert_eq!(result.branch_results.len(), 5);
//! # Ok(())
//! # }
//! ```

use crate::config::{AppConfig, ContentCategory};
use crate::content::{dialogue_workflow, quest_workflow, CONTENT_INPUTS};
use crate::error::Result;
use crate::game_spec::{extract_json, AnalysisReport, GameSpec};
use crate::generation::GenerationService;
use crate::prompts;
use crate::review::{AutoApprove, ReviewDecision, SpecReviewer};
use crate::stages::{generate_stage, generate_text, PromptSpec};
use serde_json::{json, Value};
use stagegraph_core::{
    stage_fn, Branch, CompiledGraph, ExecutionState, ParallelStage, RetryPolicy, Router, RunResult,
    StageError, StageFn, StateGraph, StateUpdate, SubworkflowStage, END,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const INPUT_ANALYSIS: &str = "input_analysis";
pub const SEEDING: &str = "seeding";
pub const SPEC_GENERATION: &str = "spec_generation";
pub const HUMAN_REVIEW: &str = "human_review";
pub const ENGINE_ROUTING: &str = "engine_routing";
pub const CONTENT_GENERATION: &str = "content_generation";
pub const RESULT_COMPILATION: &str = "result_compilation";

/// The compiled content pipeline
#[derive(Debug)]
pub struct ContentPipeline {
    graph: CompiledGraph,
    config: AppConfig,
}

/// Builder for [`ContentPipeline`]
pub struct ContentPipelineBuilder {
    service: Arc<dyn GenerationService>,
    reviewer: Arc<dyn SpecReviewer>,
    config: AppConfig,
}

impl ContentPipelineBuilder {
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Reviewer consulted at `human_review` (default: [`AutoApprove`])
    pub fn with_reviewer(mut self, reviewer: Arc<dyn SpecReviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn build(self) -> Result<ContentPipeline> {
        self.config.validate()?;
        let pipeline = &self.config.pipeline;
        let retry = pipeline.retry.clone();
        let service = self.service;

        let mut graph = StateGraph::new("content_pipeline");
        add_stage(&mut graph, INPUT_ANALYSIS, analysis_stage(service.clone()), &retry);
        add_stage(&mut graph, SEEDING, seeding_stage(service.clone()), &retry);
        add_stage(
            &mut graph,
            SPEC_GENERATION,
            spec_stage(service.clone(), pipeline.default_engine.clone()),
            &retry,
        );
        graph
            .add_node(HUMAN_REVIEW, review_stage(self.reviewer, pipeline.max_revisions))
            .add_node(ENGINE_ROUTING, routing_stage(pipeline.default_engine.clone()))
            .add_parallel(
                CONTENT_GENERATION,
                content_fanout(service, &pipeline.categories, retry)?,
            )
            .add_node(RESULT_COMPILATION, compilation_stage(pipeline.categories.clone()));

        graph
            .add_conditional_edge(
                INPUT_ANALYSIS,
                analysis_router(pipeline.completeness_threshold),
                [
                    ("needs_spec_generation", SPEC_GENERATION),
                    ("has_complete_spec", ENGINE_ROUTING),
                    ("needs_seeding", SEEDING),
                ],
            )
            .add_edge(SEEDING, SPEC_GENERATION)
            .add_edge(SPEC_GENERATION, HUMAN_REVIEW)
            .add_conditional_edge(
                HUMAN_REVIEW,
                Router::from_context("review_decision", "rejected").with_labels([
                    "approved",
                    "needs_revision",
                    "rejected",
                ]),
                [
                    ("approved", ENGINE_ROUTING),
                    ("needs_revision", SPEC_GENERATION),
                    ("rejected", END),
                ],
            )
            .add_edge(ENGINE_ROUTING, CONTENT_GENERATION)
            .add_edge(CONTENT_GENERATION, RESULT_COMPILATION)
            .set_entry(INPUT_ANALYSIS)
            .add_terminal(RESULT_COMPILATION);

        let graph = graph.compile_with_config(self.config.execution.clone())?;
        Ok(ContentPipeline {
            graph,
            config: self.config,
        })
    }
}

impl ContentPipeline {
    pub fn builder(service: Arc<dyn GenerationService>) -> ContentPipelineBuilder {
        ContentPipelineBuilder {
            service,
            reviewer: Arc::new(AutoApprove),
            config: AppConfig::default(),
        }
    }

    pub fn new(service: Arc<dyn GenerationService>, config: AppConfig) -> Result<Self> {
        Self::builder(service).with_config(config).build()
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run the pipeline for `request`
    pub async fn generate(&self, request: impl Into<String>) -> RunResult {
        self.generate_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run the pipeline, stopping early when `cancel` fires
    pub async fn generate_with_cancel(
        &self,
        request: impl Into<String>,
        cancel: CancellationToken,
    ) -> RunResult {
        let state = ExecutionState::new().with_task(request);
        let outcome = self.graph.run_with_cancel(state, cancel).await;

        info!(
            success = outcome.success,
            steps = outcome.steps,
            path = ?outcome.path,
            errors = outcome.state.errors.len(),
            "Content pipeline finished"
        );
        outcome.into_result()
    }
}

fn add_stage(graph: &mut StateGraph, name: &str, stage: StageFn, retry: &Option<RetryPolicy>) {
    match retry {
        Some(policy) => graph.add_node_with_retry(name, stage, policy.clone()),
        None => graph.add_node(name, stage),
    };
}

fn analysis_router(threshold: f64) -> Router {
    Router::new(move |state| {
        let needs_seeding = state
            .context_value("needs_seeding")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let score = state
            .context_value("completeness_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        if needs_seeding {
            "needs_seeding".to_string()
        } else if score > threshold {
            "has_complete_spec".to_string()
        } else {
            "needs_spec_generation".to_string()
        }
    })
    .with_labels(["needs_seeding", "has_complete_spec", "needs_spec_generation"])
}

fn analysis_stage(service: Arc<dyn GenerationService>) -> StageFn {
    let prompt = Arc::new(PromptSpec::new(prompts::ANALYSIS, "analysis"));
    stage_fn(move |state: ExecutionState| {
        let service = Arc::clone(&service);
        let prompt = Arc::clone(&prompt);
        async move {
            let reply = generate_text(service.as_ref(), &prompt, &state).await?;
            let report = AnalysisReport::parse(&reply);
            info!(
                score = report.completeness_score,
                needs_seeding = report.needs_seeding,
                engine = ?report.detected_engine,
                "Request analysed"
            );

            let mut update = StateUpdate::new()
                .set_context("completeness_score", json!(report.completeness_score))
                .set_context("needs_seeding", json!(report.needs_seeding));
            if let Some(engine) = &report.detected_engine {
                update = update.set_context("detected_engine", json!(engine));
            }
            Ok::<_, StageError>(update.set_output("analysis", json!(report)))
        }
    })
}

fn seeding_stage(service: Arc<dyn GenerationService>) -> StageFn {
    let prompt = Arc::new(PromptSpec::new(prompts::SEEDING, "seeding"));
    stage_fn(move |state: ExecutionState| {
        let service = Arc::clone(&service);
        let prompt = Arc::clone(&prompt);
        async move {
            let reply = generate_text(service.as_ref(), &prompt, &state).await?;
            let seeding = extract_json(&reply)
                .ok_or_else(|| StageError::failed("seeding reply was not valid JSON"))?;
            Ok::<_, StageError>(StateUpdate::new().set_context("seeding", seeding))
        }
    })
}

fn spec_stage(service: Arc<dyn GenerationService>, default_engine: String) -> StageFn {
    let prompt = Arc::new(
        PromptSpec::new(prompts::SPECIFICATION, "spec").with_inputs([
            "detected_engine",
            "seeding",
            "review_feedback",
        ]),
    );
    stage_fn(move |state: ExecutionState| {
        let service = Arc::clone(&service);
        let prompt = Arc::clone(&prompt);
        let default_engine = default_engine.clone();
        async move {
            let reply = generate_text(service.as_ref(), &prompt, &state).await?;
            let request = state.current_task.clone().unwrap_or_default();
            let engine = state
                .context_value("detected_engine")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(default_engine);

            let spec = json!(GameSpec::parse(&reply, &request, &engine));
            Ok::<_, StageError>(
                StateUpdate::new()
                    .set_context("engine", spec["engine"].clone())
                    .set_context("spec", spec.clone())
                    .set_output("spec", spec),
            )
        }
    })
}

fn review_stage(reviewer: Arc<dyn SpecReviewer>, max_revisions: usize) -> StageFn {
    stage_fn(move |state: ExecutionState| {
        let reviewer = Arc::clone(&reviewer);
        async move {
            let revisions = state
                .context_value("revision_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;

            let decision = match state.context_value("spec") {
                Some(spec) => reviewer.review(spec, revisions).await,
                None => ReviewDecision::Rejected("no specification to review".to_string()),
            };
            let decision = match decision {
                ReviewDecision::NeedsRevision(_) if revisions >= max_revisions => {
                    warn!(max_revisions, "Revision limit reached, rejecting specification");
                    ReviewDecision::Rejected(format!(
                        "revision limit of {} reached",
                        max_revisions
                    ))
                }
                other => other,
            };
            info!(decision = decision.label(), revisions, "Specification reviewed");

            let mut update = StateUpdate::new()
                .set_context("review_decision", json!(decision.label()))
                .set_output("review", json!(decision));
            if let Some(feedback) = decision.feedback() {
                update = update.set_context("review_feedback", json!(feedback));
            }
            if matches!(decision, ReviewDecision::NeedsRevision(_)) {
                update = update.set_context("revision_count", json!(revisions + 1));
            }
            Ok::<_, StageError>(update)
        }
    })
}

fn routing_stage(default_engine: String) -> StageFn {
    stage_fn(move |state: ExecutionState| {
        let engine = ["engine", "detected_engine"]
            .iter()
            .find_map(|key| state.context_value(key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| default_engine.clone());

        let mut update = StateUpdate::new()
            .set_context("engine", json!(engine))
            .set_output("engine", json!(engine));
        if state.context_value("spec").is_none() {
            let request = state.current_task.clone().unwrap_or_default();
            update = update.set_context("spec", json!(GameSpec::fallback(&request, &engine)));
        }
        info!(engine = %engine, "Engine selected");
        futures::future::ready(Ok::<_, StageError>(update))
    })
}

fn content_fanout(
    service: Arc<dyn GenerationService>,
    categories: &[ContentCategory],
    retry: Option<RetryPolicy>,
) -> Result<ParallelStage> {
    let mut branches = Vec::with_capacity(categories.len());
    for category in categories {
        let name = category.as_str();
        let stage = match category {
            ContentCategory::Code => leaf(&service, prompts::CODE, name),
            ContentCategory::Graphics => leaf(&service, prompts::GRAPHICS, name),
            ContentCategory::Audio => leaf(&service, prompts::AUDIO, name),
            ContentCategory::Dialogue => {
                let child = dialogue_workflow(service.clone(), retry.clone())?;
                SubworkflowStage::new(Arc::new(child), name)
                    .with_context_keys(CONTENT_INPUTS)
                    .into_stage()
            }
            ContentCategory::Quests => {
                let child = quest_workflow(service.clone(), retry.clone())?;
                SubworkflowStage::new(Arc::new(child), name)
                    .with_context_keys(CONTENT_INPUTS)
                    .into_stage()
            }
        };
        branches.push(Branch::new(name, stage));
    }
    Ok(ParallelStage::new(branches))
}

fn leaf(service: &Arc<dyn GenerationService>, instruction: &str, output_key: &str) -> StageFn {
    generate_stage(
        Arc::clone(service),
        PromptSpec::new(instruction, output_key).with_inputs(["engine", "spec"]),
    )
}

fn compilation_stage(categories: Vec<ContentCategory>) -> StageFn {
    stage_fn(move |state: ExecutionState| {
        let (completed, failed): (Vec<_>, Vec<_>) = categories
            .iter()
            .map(ContentCategory::as_str)
            .partition(|name| state.branch_result(name).is_some_and(|v| !v.is_null()));
        info!(completed = completed.len(), failed = failed.len(), "Results compiled");

        let summary = json!({
            "title": state.context_value("spec").and_then(|spec| spec.get("title")).cloned(),
            "engine": state.context_value("engine").cloned(),
            "completed": completed,
            "failed": failed,
            "seeding_applied": state.context_value("seeding").is_some(),
            "reviewed": state.context_value("review_decision").is_some(),
        });
        futures::future::ready(Ok::<_, StageError>(
            StateUpdate::new().set_output("summary", summary),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{Content, ScriptedGenerator};

    fn pipeline(service: Arc<ScriptedGenerator>) -> ContentPipeline {
        let mut config = AppConfig::default();
        config.pipeline.retry = None;
        ContentPipeline::new(service, config).unwrap()
    }

    #[test]
    fn test_router_labels() {
        let router = analysis_router(0.8);
        let state = |score: f64, seed: bool| {
            ExecutionState::new()
                .with_context("completeness_score", json!(score))
                .with_context("needs_seeding", json!(seed))
        };

        assert_eq!(router.route(&state(0.9, false)), "has_complete_spec");
        assert_eq!(router.route(&state(0.8, false)), "needs_spec_generation");
        assert_eq!(router.route(&state(0.9, true)), "needs_seeding");
        assert_eq!(router.route(&ExecutionState::new()), "needs_spec_generation");
    }

    #[test]
    fn test_graph_shape() {
        let service = Arc::new(ScriptedGenerator::new());
        let pipeline = pipeline(service);
        let graph = pipeline.graph().graph();

        assert_eq!(graph.entry.as_deref(), Some(INPUT_ANALYSIS));
        assert!(graph.is_terminal(RESULT_COMPILATION));
        assert_eq!(
            graph.outgoing(HUMAN_REVIEW).unwrap().targets(),
            vec![ENGINE_ROUTING, SPEC_GENERATION, END]
        );
        let mermaid = pipeline.graph().to_mermaid();
        assert!(mermaid.contains("content_generation (code, graphics, audio, dialogue, quests)"));
    }

    #[tokio::test]
    async fn test_complete_request_skips_specification() {
        let service = Arc::new(
            ScriptedGenerator::new()
                .on_prefix(
                    prompts::ANALYSIS,
                    Content::text(r#"{"completeness_score": 0.9, "detected_engine": "bevy"}"#),
                )
                .with_fallback(Content::text("done")),
        );
        let result = pipeline(service.clone()).generate("a bevy tower defense").await;

        assert!(result.success);
        assert_eq!(result.outputs["engine"], json!("bevy"));
        assert_eq!(service.count_prefix(prompts::SPECIFICATION).await, 0);
        assert_eq!(result.outputs["summary"]["failed"], json!([]));
        assert_eq!(result.outputs["summary"]["reviewed"], json!(false));
    }

    #[tokio::test]
    async fn test_single_category() {
        let service = Arc::new(ScriptedGenerator::new().with_fallback(Content::text("{}")));
        let mut config = AppConfig::default();
        config.pipeline.categories = vec![ContentCategory::Audio];
        config.pipeline.retry = None;

        let result = ContentPipeline::new(service, config)
            .unwrap()
            .generate("anything")
            .await;

        assert!(result.success);
        assert_eq!(result.branch_results.len(), 1);
        assert_eq!(result.branch_results["audio"], json!({"audio": "{}"}));
    }
}

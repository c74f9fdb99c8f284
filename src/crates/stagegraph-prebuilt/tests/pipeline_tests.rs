//! End-to-end tests for the content pipeline using scripted generation

use async_trait::async_trait;
use serde_json::{json, Value};
use stagegraph_core::ErrorKind;
use stagegraph_prebuilt::{
    prompts, AppConfig, Content, ContentPipeline, GenerationError, ReviewDecision,
    ScriptedGenerator, SpecReviewer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPLETE: &str = r#"{"completeness_score": 0.95, "detected_engine": "pygame"}"#;
const SPEC: &str = r#"```json
{"title": "Star Miner", "engine": "godot", "genre": "arcade", "complexity": "simple"}
```"#;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pipeline.retry = None;
    config
}

fn generator(analysis: &str) -> ScriptedGenerator {
    ScriptedGenerator::new()
        .on_prefix(prompts::ANALYSIS, Content::text(analysis))
        .on_prefix(prompts::SPECIFICATION, Content::text(SPEC))
        .with_fallback(Content::text("generated"))
}

/// Asks for revisions a fixed number of times, then approves
struct Picky {
    revisions: usize,
    seen: AtomicUsize,
}

impl Picky {
    fn new(revisions: usize) -> Arc<Self> {
        Arc::new(Self {
            revisions,
            seen: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SpecReviewer for Picky {
    async fn review(&self, _spec: &Value, revision: usize) -> ReviewDecision {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if revision < self.revisions {
            ReviewDecision::NeedsRevision(format!("round {} needs a boss fight", revision + 1))
        } else {
            ReviewDecision::Approved
        }
    }
}

#[tokio::test]
async fn test_incomplete_request_goes_through_specification() {
    let service = Arc::new(generator(r#"{"completeness_score": 0.3}"#));
    let pipeline = ContentPipeline::new(service.clone(), config()).unwrap();

    let result = pipeline.generate("a space mining game").await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.outputs["spec"]["title"], json!("Star Miner"));
    assert_eq!(result.outputs["engine"], json!("godot"));
    assert_eq!(result.outputs["review"], json!({"decision": "approved"}));

    let summary = &result.outputs["summary"];
    assert_eq!(summary["title"], json!("Star Miner"));
    assert_eq!(summary["completed"].as_array().unwrap().len(), 5);
    assert_eq!(summary["reviewed"], json!(true));
    assert_eq!(summary["seeding_applied"], json!(false));

    assert_eq!(service.count_prefix(prompts::SPECIFICATION).await, 1);
    assert_eq!(service.count_prefix(prompts::SEEDING).await, 0);
}

#[tokio::test]
async fn test_malformed_analysis_falls_back_to_specification() {
    let service = Arc::new(generator("It looks like a shooter, probably."));
    let pipeline = ContentPipeline::new(service.clone(), config()).unwrap();

    let result = pipeline.generate("a shooter").await;

    assert!(result.success);
    assert_eq!(result.outputs["analysis"]["parsed"], json!(false));
    assert_eq!(service.count_prefix(prompts::SPECIFICATION).await, 1);
}

#[tokio::test]
async fn test_seeding_feeds_specification() {
    let service = Arc::new(
        generator(r#"{"completeness_score": 0.5, "suggested_processing": "seeding_first"}"#)
            .on_prefix(
                prompts::SEEDING,
                Content::text(r#"{"narrative_themes": ["greed", "isolation"]}"#),
            ),
    );
    let pipeline = ContentPipeline::new(service.clone(), config()).unwrap();

    let result = pipeline.generate("a lonely asteroid miner").await;

    assert!(result.success);
    assert_eq!(result.outputs["summary"]["seeding_applied"], json!(true));

    let spec_prompt = service
        .prompts()
        .await
        .into_iter()
        .find(|p| p.starts_with(prompts::SPECIFICATION))
        .unwrap();
    assert!(spec_prompt.contains("seeding: {\"narrative_themes\":[\"greed\",\"isolation\"]}"));
}

#[tokio::test]
async fn test_malformed_seeding_halts_run() {
    let service = Arc::new(
        generator(r#"{"needs_seeding": true}"#).on_prefix(prompts::SEEDING, Content::text("no idea")),
    );
    let pipeline = ContentPipeline::new(service.clone(), config()).unwrap();

    let result = pipeline.generate("something").await;

    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].node, "seeding");
    assert_eq!(result.errors[0].kind, ErrorKind::NodeFailure);
    assert!(result.outputs.get("summary").is_none());
    assert!(result.branch_results.is_empty());
}

#[tokio::test]
async fn test_revision_feedback_reaches_generator() {
    let service = Arc::new(generator("{}"));
    let reviewer = Picky::new(1);
    let pipeline = ContentPipeline::builder(service.clone())
        .with_config(config())
        .with_reviewer(reviewer.clone())
        .build()
        .unwrap();

    let result = pipeline.generate("a platformer").await;

    assert!(result.success);
    assert_eq!(reviewer.seen.load(Ordering::SeqCst), 2);

    let spec_prompts: Vec<String> = service
        .prompts()
        .await
        .into_iter()
        .filter(|p| p.starts_with(prompts::SPECIFICATION))
        .collect();
    assert_eq!(spec_prompts.len(), 2);
    assert!(!spec_prompts[0].contains("review_feedback"));
    assert!(spec_prompts[1].contains("review_feedback: \"round 1 needs a boss fight\""));
}

#[tokio::test]
async fn test_revision_loop_is_bounded() {
    let service = Arc::new(generator("{}"));
    let reviewer = Picky::new(usize::MAX);
    let mut config = config();
    config.pipeline.max_revisions = 2;
    let pipeline = ContentPipeline::builder(service.clone())
        .with_config(config)
        .with_reviewer(reviewer.clone())
        .build()
        .unwrap();

    let result = pipeline.generate("a platformer").await;

    // Rejection ends the run without content, but it is not a failure
    assert!(result.success);
    assert!(result.errors.is_empty());
    assert!(result.outputs.get("summary").is_none());
    assert_eq!(
        result.outputs["review"],
        json!({"decision": "rejected", "feedback": "revision limit of 2 reached"})
    );
    assert_eq!(reviewer.seen.load(Ordering::SeqCst), 3);
    assert_eq!(service.count_prefix(prompts::SPECIFICATION).await, 3);
}

#[tokio::test]
async fn test_failing_category_is_isolated() {
    let service = Arc::new(
        generator(COMPLETE)
            .fail_on_prefix(prompts::GRAPHICS, GenerationError::rate_limited("quota exceeded")),
    );
    let pipeline = ContentPipeline::new(service, config()).unwrap();

    let result = pipeline.generate("a pygame snake clone").await;

    assert!(!result.success);
    assert_eq!(result.branch_results.len(), 5);
    assert_eq!(result.branch_results["graphics"], Value::Null);
    assert_eq!(result.branch_results["code"], json!({"code": "generated"}));
    assert_eq!(
        result.branch_results["dialogue"],
        json!({"dialogue": {"outline": "generated", "lines": "generated"}})
    );

    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    assert_eq!(error.kind, ErrorKind::BranchFailure);
    assert_eq!(error.node, "content_generation");
    assert_eq!(error.branch.as_deref(), Some("graphics"));
    assert!(error.message.contains("quota exceeded"));

    // Compilation still runs and reports the gap
    assert_eq!(result.outputs["summary"]["failed"], json!(["graphics"]));
}

#[tokio::test]
async fn test_failing_subworkflow_is_summarized() {
    let service = Arc::new(
        generator(COMPLETE).fail_on_prefix(
            prompts::QUEST_REWARDS,
            GenerationError::invalid_response("empty reply"),
        ),
    );
    let pipeline = ContentPipeline::new(service, config()).unwrap();

    let result = pipeline.generate("an rpg").await;

    assert_eq!(result.branch_results["quests"], Value::Null);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].branch.as_deref(), Some("quests"));
    assert!(result.errors[0].message.contains("subworkflow 'quests' failed"));
    assert!(result.errors[0].message.contains("[rewards]"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let service = Arc::new(
        ScriptedGenerator::new()
            .fail_on_prefix(prompts::ANALYSIS, GenerationError::rate_limited("busy"))
            .on_prefix(prompts::ANALYSIS, Content::text(COMPLETE))
            .with_fallback(Content::text("generated")),
    );
    // Default configuration retries generation stages
    let pipeline = ContentPipeline::builder(service.clone()).build().unwrap();

    let result = pipeline.generate("a pygame pong clone").await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(service.count_prefix(prompts::ANALYSIS).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_fanout() {
    let service = Arc::new(generator(COMPLETE).with_latency(Duration::from_secs(10)));
    let pipeline = ContentPipeline::new(service, config()).unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        trigger.cancel();
    });

    let result = pipeline.generate_with_cancel("a pygame pong clone", token).await;

    assert!(!result.success);
    assert_eq!(result.branch_results.len(), 5);
    assert!(result.branch_results.values().all(Value::is_null));
    assert!(result.errors.iter().all(|e| e.kind == ErrorKind::Cancelled));
    assert!(result.outputs.get("summary").is_none());
}

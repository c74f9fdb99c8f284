//! Narrative content sub-workflows
//!
//! Two small child graphs the pipeline delegates to from its fan-out:
//!
//! ```text
//! dialogue:  outline ──► lines
//! quests:    objectives ──► rewards
//! ```
//!
//! Both read `engine` and `spec` from the context they are given and leave
//! their results in their own outputs, which the delegating node nests under
//! a single key of the parent.

use crate::generation::GenerationService;
use crate::prompts;
use crate::stages::{generate_stage, PromptSpec};
use stagegraph_core::{CompiledGraph, RetryPolicy, StateGraph};
use std::sync::Arc;

/// Context keys a content sub-workflow reads from its parent
pub const CONTENT_INPUTS: [&str; 3] = ["engine", "spec", "seeding"];

/// `outline → lines`
pub fn dialogue_workflow(
    service: Arc<dyn GenerationService>,
    retry: Option<RetryPolicy>,
) -> stagegraph_core::Result<CompiledGraph> {
    two_step(
        "dialogue",
        service,
        retry,
        PromptSpec::new(prompts::DIALOGUE_OUTLINE, "outline").with_inputs(CONTENT_INPUTS),
        PromptSpec::new(prompts::DIALOGUE_LINES, "lines").with_inputs(["outline"]),
    )
}

/// `objectives → rewards`
pub fn quest_workflow(
    service: Arc<dyn GenerationService>,
    retry: Option<RetryPolicy>,
) -> stagegraph_core::Result<CompiledGraph> {
    two_step(
        "quests",
        service,
        retry,
        PromptSpec::new(prompts::QUEST_OBJECTIVES, "objectives").with_inputs(CONTENT_INPUTS),
        PromptSpec::new(prompts::QUEST_REWARDS, "rewards").with_inputs(["objectives", "engine"]),
    )
}

fn two_step(
    name: &str,
    service: Arc<dyn GenerationService>,
    retry: Option<RetryPolicy>,
    first: PromptSpec,
    second: PromptSpec,
) -> stagegraph_core::Result<CompiledGraph> {
    let first_name = first.output_key.clone();
    let second_name = second.output_key.clone();

    let mut graph = StateGraph::new(name);
    for prompt in [first, second] {
        let node = prompt.output_key.clone();
        let stage = generate_stage(Arc::clone(&service), prompt);
        match &retry {
            Some(policy) => graph.add_node_with_retry(node, stage, policy.clone()),
            None => graph.add_node(node, stage),
        };
    }
    graph
        .add_edge(first_name.clone(), second_name.clone())
        .set_entry(first_name)
        .add_terminal(second_name);
    graph.compile()
}

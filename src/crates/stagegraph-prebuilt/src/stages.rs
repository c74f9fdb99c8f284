//! Generation stages
//!
//! [`generate_stage`] turns a [`PromptSpec`] into a stage function: it picks
//! the prompt's inputs out of the state, renders the prompt, calls the
//! [`GenerationService`] and stores the reply text under one output key.
//!
//! Rendered prompts look like this:
//!
//! ```text
//! Write the core game code for this specification.
//!
//! Request: a pirate platformer
//! engine: "pygame"
//! spec: {"title":"Plunder"}
//! ```

use crate::generation::GenerationService;
use serde_json::{Map, Value};
use stagegraph_core::{stage_fn, ExecutionState, StageError, StageFn, StateUpdate};
use std::sync::Arc;
use tracing::debug;

/// What a generation stage asks for and where the answer goes
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSpec {
    pub instruction: String,
    /// State keys included in the prompt, looked up in outputs then context
    pub inputs: Vec<String>,
    pub output_key: String,
}

impl PromptSpec {
    pub fn new(instruction: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            inputs: Vec::new(),
            output_key: output_key.into(),
        }
    }

    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Values for this prompt's inputs that are present in `state`
    pub fn collect_inputs(&self, state: &ExecutionState) -> Map<String, Value> {
        self.inputs
            .iter()
            .filter_map(|key| {
                state
                    .output(key)
                    .or_else(|| state.context_value(key))
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }

    pub fn render(&self, state: &ExecutionState, inputs: &Map<String, Value>) -> String {
        let mut prompt = self.instruction.clone();
        prompt.push_str("\n\n");
        if let Some(task) = &state.current_task {
            prompt.push_str(&format!("Request: {}\n", task));
        }
        for (key, value) in inputs {
            prompt.push_str(&format!("{}: {}\n", key, value));
        }
        prompt
    }
}

/// Render, generate and store the reply under `prompt.output_key`
pub async fn generate_text(
    service: &dyn GenerationService,
    prompt: &PromptSpec,
    state: &ExecutionState,
) -> Result<String, StageError> {
    let inputs = prompt.collect_inputs(state);
    let rendered = prompt.render(state, &inputs);
    debug!(output = %prompt.output_key, inputs = inputs.len(), "Requesting generation");

    let content = service.generate(&rendered, &inputs).await?;
    Ok(content.text)
}

/// A stage that generates text and writes it to `prompt.output_key`
///
/// Generation failures become [`StageError::Generation`].
pub fn generate_stage(service: Arc<dyn GenerationService>, prompt: PromptSpec) -> StageFn {
    let prompt = Arc::new(prompt);
    stage_fn(move |state: ExecutionState| {
        let service = Arc::clone(&service);
        let prompt = Arc::clone(&prompt);
        async move {
            let text = generate_text(service.as_ref(), &prompt, &state).await?;
            Ok::<_, StageError>(
                StateUpdate::new().set_output(prompt.output_key.clone(), Value::String(text)),
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{Content, GenerationError, ScriptedGenerator};
    use serde_json::json;

    fn state() -> ExecutionState {
        ExecutionState::new()
            .with_task("a pirate platformer")
            .with_context("engine", json!("pygame"))
            .with_context("spec", json!({"title": "stale"}))
    }

    #[test]
    fn test_inputs_prefer_outputs() {
        let mut state = state();
        state.outputs.insert("spec".to_string(), json!({"title": "Plunder"}));

        let prompt = PromptSpec::new("Write code.", "code").with_inputs(["engine", "spec", "missing"]);
        let inputs = prompt.collect_inputs(&state);

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs["spec"], json!({"title": "Plunder"}));
        assert_eq!(
            prompt.render(&state, &inputs),
            "Write code.\n\nRequest: a pirate platformer\nengine: \"pygame\"\nspec: {\"title\":\"Plunder\"}\n"
        );
    }

    #[tokio::test]
    async fn test_generate_stage_writes_output() {
        let service = Arc::new(
            ScriptedGenerator::new().on_prefix("Write code.", Content::text("print('ahoy')")),
        );
        let stage = generate_stage(
            service.clone(),
            PromptSpec::new("Write code.", "code").with_inputs(["engine"]),
        );

        let output = stage(state()).await.unwrap();
        let mut after = state();
        after.apply(output);

        assert_eq!(after.output("code"), Some(&json!("print('ahoy')")));
        let prompts = service.prompts().await;
        assert!(prompts[0].contains("engine: \"pygame\""));
    }

    #[tokio::test]
    async fn test_generation_failure_maps_to_stage_error() {
        let service = Arc::new(
            ScriptedGenerator::new()
                .fail_on_prefix("Write", GenerationError::unavailable("offline")),
        );
        let stage = generate_stage(service, PromptSpec::new("Write code.", "code"));

        let err = stage(state()).await.unwrap_err();
        assert_eq!(err, StageError::generation("unavailable", "offline"));
    }
}

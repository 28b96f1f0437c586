//! Chain and step definitions.

use serde::{Deserialize, Serialize};

use crate::{ChainId, StepId};

/// Placeholder substituted with the current text when a prompt is rendered.
pub const INPUT_PLACEHOLDER: &str = "{{input}}";

/// An ordered pipeline of model steps applied sequentially to evolving text.
///
/// A chain is read-only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    /// Chain identifier.
    pub id: ChainId,

    /// Human-readable name.
    pub name: String,

    /// Optional description.
    #[serde(default)]
    pub description: String,

    /// Steps in execution order.
    pub steps: Vec<ChainStep>,
}

impl Chain {
    /// Create an empty chain.
    pub fn new(id: impl Into<ChainId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
        }
    }

    /// Builder method to append a step.
    pub fn with_step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if the chain has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One model invocation within a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    /// Step identifier, unique within the chain.
    pub id: StepId,

    /// Display name used in logs and error messages.
    pub name: String,

    /// Role of the step (e.g. "analyzer", "summarizer").
    #[serde(default)]
    pub role: String,

    /// Backend type tag (e.g. "openai", "anthropic", "ollama").
    pub backend: String,

    /// Prompt template. `{{input}}` is replaced with the current text.
    pub prompt_template: String,

    /// Generation parameters forwarded to the invoker.
    #[serde(default)]
    pub params: GenerationParams,
}

impl ChainStep {
    /// Create a step with default generation parameters.
    pub fn new(
        id: impl Into<StepId>,
        backend: impl Into<String>,
        prompt_template: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            role: String::new(),
            backend: backend.into(),
            prompt_template: prompt_template.into(),
            params: GenerationParams::default(),
        }
    }

    /// Builder method to set the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Builder method to set generation parameters.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Render the prompt for the given input text.
    ///
    /// Templates without a placeholder get the input appended after a blank line.
    pub fn render_prompt(&self, input: &str) -> String {
        if self.prompt_template.contains(INPUT_PLACEHOLDER) {
            self.prompt_template.replace(INPUT_PLACEHOLDER, input)
        } else if self.prompt_template.is_empty() {
            input.to_string()
        } else {
            format!("{}\n\n{}", self.prompt_template, input)
        }
    }
}

/// Model generation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Model name; the invoker picks its default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum output tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

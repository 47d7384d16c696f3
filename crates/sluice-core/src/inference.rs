use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A text-completion response in the OpenAI `/v1/completions` shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

/// One candidate completion. `text` is optional because servers are not
/// obliged to send it, and a missing text is a row-level failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl Choice {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            index: 0,
            text: Some(text.into()),
            finish_reason: None,
        }
    }
}

/// The prompt that was sent paired with what came back for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub example: String,
    pub inference: Completion,
    pub model_id: Option<String>,
}

impl InferenceResult {
    pub fn new(example: impl Into<String>, inference: Completion) -> Self {
        Self {
            example: example.into(),
            inference,
            model_id: None,
        }
    }
}

impl fmt::Display for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let output = self
            .inference
            .choices
            .first()
            .and_then(|c| c.text.as_deref())
            .unwrap_or("");
        write!(f, "Input: {}, Output: {}", self.example, output)
    }
}

/// A model-serving endpoint that turns prompts into completions.
///
/// Implementations own batching, request concurrency and backpressure.
/// `run_inference` returns exactly one result per prompt, in prompt order.
#[async_trait]
pub trait InferenceHandler: Send + Sync {
    fn model_id(&self) -> &str;
    async fn run_inference(&self, batch: &[String]) -> Result<Vec<InferenceResult>>;
}

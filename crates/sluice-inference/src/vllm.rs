use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use sluice_core::config::PipelineConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::inference::{Completion, InferenceHandler, InferenceResult};

/// Text-completion handler for a vLLM server's OpenAI-compatible API.
///
/// Each prompt is one `/v1/completions` request; at most `max_concurrency`
/// requests are in flight at once.
#[derive(Clone)]
pub struct VllmCompletionsHandler {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    max_concurrency: usize,
}

// ── OpenAI completions request/response types ──────────────────────────────

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelCard>,
}

#[derive(Debug, Deserialize)]
struct ModelCard {
    id: String,
}

// ── Implementation ─────────────────────────────────────────────────────────

impl VllmCompletionsHandler {
    pub fn new(base_url: &str, config: &PipelineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: None,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Verify the server is reachable and serves the configured model.
    pub async fn connect(self) -> Result<Self> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SluiceError::Inference(format!("Inference server unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(SluiceError::Inference(format!(
                "Model listing returned status {status}: {body}"
            )));
        }

        let models: ModelList = response
            .json()
            .await
            .map_err(|e| SluiceError::Inference(format!("Failed to parse model list: {e}")))?;

        if !models.data.iter().any(|m| m.id == self.model) {
            let served: Vec<&str> = models.data.iter().map(|m| m.id.as_str()).collect();
            return Err(SluiceError::Inference(format!(
                "Model '{}' is not served by {} (serving {:?})",
                self.model, self.base_url, served
            )));
        }

        tracing::info!(model = %self.model, base_url = %self.base_url, "Connected to inference server");
        Ok(self)
    }

    async fn complete(&self, prompt: &str) -> Result<Completion> {
        let request = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        tracing::debug!(
            model = %self.model,
            prompt_len = prompt.len(),
            "Sending completion request"
        );

        let response = self
            .client
            .post(format!("{}/v1/completions", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| SluiceError::Inference(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(SluiceError::Inference(format!(
                "Completions API returned status {status}: {body}"
            )));
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| SluiceError::Inference(format!("Failed to parse API response: {e}")))?;

        tracing::debug!(
            choices = completion.choices.len(),
            finish_reason = ?completion.choices.first().and_then(|c| c.finish_reason.as_deref()),
            "Received completion"
        );

        Ok(completion)
    }
}

#[async_trait]
impl InferenceHandler for VllmCompletionsHandler {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn run_inference(&self, batch: &[String]) -> Result<Vec<InferenceResult>> {
        tracing::debug!(count = batch.len(), "Starting batch inference");

        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = tokio::task::JoinSet::new();

        for (i, prompt) in batch.iter().enumerate() {
            let handler = self.clone();
            let prompt = prompt.clone();
            let permits = permits.clone();

            join_set.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => handler.complete(&prompt).await,
                    Err(e) => Err(SluiceError::Internal(format!("Semaphore closed: {e}"))),
                };
                (i, prompt, result)
            });
        }

        let mut slots: Vec<Option<InferenceResult>> = vec![None; batch.len()];

        while let Some(join_result) = join_set.join_next().await {
            match join_result {
                Ok((i, prompt, Ok(completion))) => {
                    slots[i] = Some(InferenceResult {
                        example: prompt,
                        inference: completion,
                        model_id: Some(self.model.clone()),
                    });
                }
                Ok((i, _, Err(e))) => {
                    tracing::error!(prompt_index = i, error = %e, "Inference failed for prompt in batch");
                    join_set.abort_all();
                    return Err(e);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Task panicked during batch inference");
                    join_set.abort_all();
                    return Err(SluiceError::Internal(format!("Task join error: {join_err}")));
                }
            }
        }

        let results = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or_else(|| {
                    SluiceError::Internal(format!("No inference result for prompt {i}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(count = results.len(), "Batch inference completed");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Echoes the prompt back as the completion text.
    struct EchoCompletion;

    impl Respond for EchoCompletion {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            let prompt = body["prompt"].as_str().unwrap_or_default();
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-echo",
                "object": "text_completion",
                "model": body["model"],
                "choices": [{"index": 0, "text": format!(" echo {prompt}"), "finish_reason": "stop"}]
            }))
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            max_concurrency: 2,
            max_tokens: Some(64),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn results_keep_prompt_order() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "google/gemma-2-2b-it",
                "max_tokens": 64
            })))
            .respond_with(EchoCompletion)
            .expect(5)
            .mount(&server)
            .await;

        let handler = VllmCompletionsHandler::new(&server.uri(), &config());
        let prompts: Vec<String> = (0..5).map(|i| format!("p{i}")).collect();
        let results = handler.run_inference(&prompts).await.unwrap();

        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.example, format!("p{i}"));
            assert_eq!(
                result.inference.choices[0].text.as_deref(),
                Some(format!(" echo p{i}").as_str())
            );
            assert_eq!(result.model_id.as_deref(), Some("google/gemma-2-2b-it"));
        }
    }

    #[tokio::test]
    async fn empty_choices_pass_through() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cmpl-empty",
                "model": "google/gemma-2-2b-it",
                "choices": []
            })))
            .mount(&server)
            .await;

        let handler = VllmCompletionsHandler::new(&server.uri(), &config());
        let results = handler.run_inference(&["ping".to_string()]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].inference.choices.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_makes_no_requests() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(EchoCompletion)
            .expect(0)
            .mount(&server)
            .await;

        let handler = VllmCompletionsHandler::new(&server.uri(), &config());
        assert!(handler.run_inference(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_error_fails_batch() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("CUDA out of memory"))
            .mount(&server)
            .await;

        let handler = VllmCompletionsHandler::new(&server.uri(), &config());
        let err = handler
            .run_inference(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::Inference(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn connect_checks_served_model() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "data": [{"id": "google/gemma-2-2b-it", "object": "model"}]
            })))
            .mount(&server)
            .await;

        let handler = VllmCompletionsHandler::new(&server.uri(), &config());
        assert!(handler.clone().connect().await.is_ok());

        let other = PipelineConfig {
            model: "meta-llama/Llama-3.1-8B".into(),
            ..config()
        };
        let err = VllmCompletionsHandler::new(&server.uri(), &other)
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SluiceError::Inference(ref m) if m.contains("not served")));
    }
}

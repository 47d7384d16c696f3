use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use sluice_core::error::{Result, SluiceError};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A local vLLM OpenAI-compatible server running as a child process.
///
/// The process is killed when this value is dropped.
pub struct VllmServer {
    child: Child,
    base_url: String,
    http: reqwest::Client,
}

pub fn server_args(model: &str, port: u16, extra_args: &[String]) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        "vllm.entrypoints.openai.api_server".to_string(),
        "--model".to_string(),
        model.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];
    args.extend(extra_args.iter().cloned());
    args
}

impl VllmServer {
    pub async fn start(
        model: &str,
        port: u16,
        extra_args: &[String],
        startup_timeout: Duration,
    ) -> Result<Self> {
        let args = server_args(model, port, extra_args);
        tracing::info!(model = %model, port, "Starting local vLLM server");

        let child = Command::new("python")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SluiceError::Inference(format!("Failed to launch vLLM server: {e}")))?;

        let mut server = Self::from_child(child, format!("http://localhost:{port}"));
        server.wait_until_healthy(startup_timeout).await?;
        Ok(server)
    }

    fn from_child(child: Child, base_url: String) -> Self {
        Self {
            child,
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn wait_until_healthy(&mut self, timeout: Duration) -> Result<()> {
        let health_url = format!("{}/health", self.base_url);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait().map_err(|e| {
                SluiceError::Inference(format!("Failed to poll vLLM server process: {e}"))
            })? {
                return Err(SluiceError::Inference(format!(
                    "vLLM server exited during startup with {status}"
                )));
            }

            match self.http.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(base_url = %self.base_url, "vLLM server is healthy");
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::debug!(status = %resp.status(), "vLLM server not ready yet");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "vLLM server not reachable yet");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SluiceError::Inference(format!(
                    "vLLM server not healthy after {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!(base_url = %self.base_url, "Stopping local vLLM server");
        self.child
            .kill()
            .await
            .map_err(|e| SluiceError::Inference(format!("Failed to stop vLLM server: {e}")))
    }
}

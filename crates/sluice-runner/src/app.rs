use std::sync::Arc;

use sluice_core::{PipelineConfig, Result};
use sluice_inference::{VllmCompletionsHandler, VllmServer, DEFAULT_STARTUP_TIMEOUT};
use sluice_pipeline::BatchInferencePipeline;
use sluice_warehouse::{BigQueryClient, BigQuerySink, BigQuerySource};

/// Everything a run needs. Holding `server` keeps a local vLLM process alive.
pub struct App {
    pub pipeline: BatchInferencePipeline,
    pub server: Option<VllmServer>,
}

impl App {
    pub async fn build(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let (server, base_url) = match &config.vllm_base_url {
            Some(url) => (None, url.clone()),
            None => {
                let server = VllmServer::start(
                    &config.model,
                    config.vllm_port,
                    &config.vllm_extra_args,
                    DEFAULT_STARTUP_TIMEOUT,
                )
                .await?;
                let url = server.base_url().to_string();
                (Some(server), url)
            }
        };

        let handler = VllmCompletionsHandler::new(&base_url, config).connect().await?;

        let bigquery = Arc::new(BigQueryClient::new(config)?);
        let source = BigQuerySource::new(bigquery.clone(), config);
        let sink = BigQuerySink::new(bigquery, config)?;

        tracing::info!(
            destination = %sink.table(),
            model = %config.model,
            inference_url = %base_url,
            "Pipeline wired"
        );

        let pipeline =
            BatchInferencePipeline::new(Arc::new(source), Arc::new(handler), Arc::new(sink));

        Ok(Self { pipeline, server })
    }
}

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

mod app;

use app::App;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::from_default_env();
    let filter = match "sluice=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = sluice_core::PipelineConfig::from_env();
    tracing::info!(
        query = %config.source_query,
        destination = %config.destination_table,
        model = %config.model,
        "SLUICE batch inference starting"
    );

    let app = match App::build(&config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize pipeline");
            return ExitCode::FAILURE;
        }
    };

    let outcome = app.pipeline.run().await;

    if let Some(server) = app.server {
        if let Err(e) = server.shutdown().await {
            tracing::warn!(error = %e, "Local vLLM server did not stop cleanly");
        }
    }

    match outcome {
        Ok(summary) => {
            match serde_json::to_string(&summary) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize run summary"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Pipeline run failed");
            ExitCode::FAILURE
        }
    }
}

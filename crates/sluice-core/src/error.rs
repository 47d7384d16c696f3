use thiserror::Error;

#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Warehouse API error: {0}")]
    Warehouse(String),

    #[error("Job error ({job_id}): {message}")]
    Job { job_id: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SluiceError>;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::warehouse::{CreateDisposition, TableRef, TableSchema, WriteDisposition};

pub const DEFAULT_SOURCE_QUERY: &str =
    "select content from `dataflow-autotuning.rgagnon_sample_data.hacker_news`;";
pub const DEFAULT_DESTINATION_TABLE: &str =
    "dataflow-autotuning.rgagnon_sample_data.gemma_vllm_inference";
pub const DEFAULT_DESTINATION_SCHEMA: &str = "input:STRING, output:STRING";
pub const DEFAULT_MODEL: &str = "google/gemma-2-2b-it";
pub const DEFAULT_BIGQUERY_API_BASE: &str = "https://bigquery.googleapis.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source_query: String,
    pub destination_table: String,
    pub destination_schema: String,
    pub write_disposition: WriteDisposition,
    pub create_disposition: CreateDisposition,
    pub model: String,
    /// Project that runs and bills the query and load jobs.
    pub project: Option<String>,
    pub location: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub bigquery_api_base: String,
    /// When unset, a local vLLM server is started on `vllm_port`.
    pub vllm_base_url: Option<String>,
    pub vllm_port: u16,
    /// Extra command-line arguments for a locally started vLLM server.
    pub vllm_extra_args: Vec<String>,
    pub max_tokens: Option<u32>,
    /// Rows per source page; each page is one inference batch.
    pub page_size: u32,
    pub max_concurrency: usize,
    pub job_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_query: DEFAULT_SOURCE_QUERY.into(),
            destination_table: DEFAULT_DESTINATION_TABLE.into(),
            destination_schema: DEFAULT_DESTINATION_SCHEMA.into(),
            write_disposition: WriteDisposition::WriteTruncate,
            create_disposition: CreateDisposition::CreateIfNeeded,
            model: DEFAULT_MODEL.into(),
            project: None,
            location: None,
            access_token: None,
            bigquery_api_base: DEFAULT_BIGQUERY_API_BASE.into(),
            vllm_base_url: None,
            vllm_port: 8000,
            vllm_extra_args: Vec::new(),
            max_tokens: None,
            page_size: 1_000,
            max_concurrency: 16,
            job_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty and unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            source_query: var("SLUICE_SOURCE_QUERY").unwrap_or(defaults.source_query),
            destination_table: var("SLUICE_DESTINATION_TABLE")
                .unwrap_or(defaults.destination_table),
            destination_schema: var("SLUICE_DESTINATION_SCHEMA")
                .unwrap_or(defaults.destination_schema),
            write_disposition: defaults.write_disposition,
            create_disposition: defaults.create_disposition,
            model: var("SLUICE_MODEL").unwrap_or(defaults.model),
            project: var("GOOGLE_CLOUD_PROJECT"),
            location: var("SLUICE_LOCATION"),
            access_token: var("GOOGLE_OAUTH_ACCESS_TOKEN"),
            bigquery_api_base: var("BIGQUERY_API_BASE").unwrap_or(defaults.bigquery_api_base),
            vllm_base_url: var("VLLM_BASE_URL"),
            vllm_port: parsed(var("VLLM_PORT")).unwrap_or(defaults.vllm_port),
            vllm_extra_args: var("SLUICE_VLLM_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.vllm_extra_args),
            max_tokens: parsed(var("SLUICE_MAX_TOKENS")),
            page_size: parsed(var("SLUICE_PAGE_SIZE")).unwrap_or(defaults.page_size),
            max_concurrency: parsed(var("SLUICE_MAX_CONCURRENCY"))
                .unwrap_or(defaults.max_concurrency),
            job_timeout_secs: parsed(var("SLUICE_JOB_TIMEOUT_SECS"))
                .unwrap_or(defaults.job_timeout_secs),
        }
    }

    pub fn destination(&self) -> Result<TableRef> {
        self.destination_table.parse()
    }

    pub fn schema(&self) -> Result<TableSchema> {
        TableSchema::parse(&self.destination_schema)
    }

    /// Job project falls back to the destination table's project.
    pub fn job_project(&self) -> Result<String> {
        match &self.project {
            Some(p) if !p.is_empty() => Ok(p.clone()),
            _ => Ok(self.destination()?.project),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_query.trim().is_empty() {
            return Err(SluiceError::Config("Source query is empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(SluiceError::Config("Model identifier is empty".into()));
        }
        if self.page_size == 0 {
            return Err(SluiceError::Config("Page size must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(SluiceError::Config("Max concurrency must be at least 1".into()));
        }
        url::Url::parse(&self.bigquery_api_base).map_err(|e| {
            SluiceError::Config(format!("Invalid BigQuery API base URL: {e}"))
        })?;
        if let Some(base) = &self.vllm_base_url {
            url::Url::parse(base)
                .map_err(|e| SluiceError::Config(format!("Invalid vLLM base URL: {e}")))?;
        }
        self.destination()?;
        self.schema()?.ensure_output_columns()?;
        Ok(())
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

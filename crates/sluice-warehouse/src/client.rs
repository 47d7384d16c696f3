use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sluice_core::config::PipelineConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::warehouse::{CreateDisposition, TableRef, TableSchema, WriteDisposition};

use crate::auth::TokenProvider;

/// Server-side wait for `jobs.query` / `jobs.getQueryResults` (milliseconds).
pub(crate) const QUERY_WAIT_MS: u64 = 10_000;
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ── BigQuery REST request/response types ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryRequest {
    pub query: String,
    pub use_legacy_sql: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryResponse {
    pub job_reference: Option<JobReference>,
    #[serde(default)]
    pub job_complete: bool,
    pub schema: Option<TableSchema>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
    pub page_token: Option<String>,
    pub total_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TableCell {
    #[serde(default)]
    pub v: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_reference: Option<JobReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadConfiguration {
    pub destination_table: TableRef,
    pub schema: TableSchema,
    pub source_format: String,
    pub write_disposition: WriteDisposition,
    pub create_disposition: CreateDisposition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: String,
    #[serde(default)]
    pub error_result: Option<ErrorProto>,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorProto {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(r), Some(m)) => format!("{r}: {m}"),
            (None, Some(m)) => m.clone(),
            (Some(r), None) => r.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────────────

/// Thin BigQuery v2 REST client covering query and load jobs.
pub struct BigQueryClient {
    http: reqwest::Client,
    api_base: String,
    project: String,
    location: Option<String>,
    tokens: TokenProvider,
}

impl BigQueryClient {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let tokens = match &config.access_token {
            Some(token) => TokenProvider::fixed(token.clone()),
            None => TokenProvider::metadata_server(),
        };
        Ok(Self::with_api_base(
            &config.bigquery_api_base,
            config.job_project()?,
            config.location.clone(),
            tokens,
        ))
    }

    pub fn with_api_base(
        api_base: &str,
        project: impl Into<String>,
        location: Option<String>,
        tokens: TokenProvider,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            project: project.into(),
            location,
            tokens,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    fn project_url(&self, upload: bool) -> String {
        let prefix = if upload { "/upload" } else { "" };
        format!(
            "{}{prefix}/bigquery/v2/projects/{}",
            self.api_base,
            urlencoding::encode(&self.project)
        )
    }

    pub(crate) async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let url = format!("{}/queries", self.project_url(false));
        tracing::debug!(url = %url, "Submitting BigQuery query");

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.tokens.token().await?)
            .json(request)
            .send()
            .await
            .map_err(|e| SluiceError::Warehouse(format!("Query request failed: {e}")))?;

        parse_json(check_status(response).await?).await
    }

    pub(crate) async fn get_query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<QueryResponse> {
        let url = format!(
            "{}/queries/{}",
            self.project_url(false),
            urlencoding::encode(&job.job_id)
        );

        let mut params: Vec<(&str, String)> = vec![("timeoutMs", QUERY_WAIT_MS.to_string())];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            params.push(("location", location.clone()));
        }
        if let Some(max) = max_results {
            params.push(("maxResults", max.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.tokens.token().await?)
            .query(&params)
            .send()
            .await
            .map_err(|e| SluiceError::Warehouse(format!("getQueryResults request failed: {e}")))?;

        parse_json(check_status(response).await?).await
    }

    /// Start a load job with an inline multipart/related upload.
    pub(crate) async fn insert_load_job(&self, job: &Job, data: Vec<u8>) -> Result<Job> {
        let url = format!("{}/jobs", self.project_url(true));
        let boundary = format!("sluice_{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &serde_json::to_vec(job)?, &data);

        tracing::debug!(url = %url, payload_bytes = data.len(), "Submitting BigQuery load job");

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.tokens.token().await?)
            .query(&[("uploadType", "multipart")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| SluiceError::Warehouse(format!("Load job request failed: {e}")))?;

        parse_json(check_status(response).await?).await
    }

    pub(crate) async fn get_job(&self, job: &JobReference) -> Result<Job> {
        let url = format!(
            "{}/jobs/{}",
            self.project_url(false),
            urlencoding::encode(&job.job_id)
        );
        let mut request = self.http.get(&url).bearer_auth(self.tokens.token().await?);
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            request = request.query(&[("location", location)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SluiceError::Warehouse(format!("jobs.get request failed: {e}")))?;

        parse_json(check_status(response).await?).await
    }

    /// Poll until the job reaches `DONE`, failing on `errorResult` or timeout.
    pub(crate) async fn wait_for_job(&self, job: Job, timeout: Duration) -> Result<Job> {
        let reference = job.job_reference.clone().ok_or_else(|| {
            SluiceError::Warehouse("Job response is missing jobReference".into())
        })?;

        timed(timeout, &reference.job_id, self.poll_until_done(job, &reference)).await?
    }

    async fn poll_until_done(&self, mut current: Job, reference: &JobReference) -> Result<Job> {
        loop {
            if let Some(status) = &current.status {
                if status.state == "DONE" {
                    if let Some(err) = &status.error_result {
                        return Err(SluiceError::Job {
                            job_id: reference.job_id.clone(),
                            message: err.describe(),
                        });
                    }
                    return Ok(current);
                }
                tracing::debug!(job_id = %reference.job_id, state = %status.state, "Job not done yet");
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
            current = self.get_job(reference).await?;
        }
    }
}

/// Wrap an async operation with a deadline, converting expiry to a job error.
pub(crate) async fn timed<T, F: Future<Output = T>>(
    timeout: Duration,
    job_id: &str,
    op: F,
) -> Result<T> {
    tokio::time::timeout(timeout, op).await.map_err(|_| {
        tracing::warn!(job_id = %job_id, "BigQuery job timed out after {}s", timeout.as_secs());
        SluiceError::Job {
            job_id: job_id.to_string(),
            message: format!("timed out after {}s", timeout.as_secs()),
        }
    })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    Err(SluiceError::Warehouse(format!(
        "BigQuery API returned status {status}: {body}"
    )))
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| SluiceError::Warehouse(format!("Failed to parse API response: {e}")))
}

fn multipart_related(boundary: &str, metadata: &[u8], data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + data.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

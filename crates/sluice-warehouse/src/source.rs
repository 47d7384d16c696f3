use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use sluice_core::config::PipelineConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::record::InputRecord;
use sluice_core::warehouse::{RecordPages, SourceReader, TableSchema};

use crate::client::{
    timed, BigQueryClient, JobReference, QueryRequest, QueryResponse, TableRow, QUERY_WAIT_MS,
};

const CONTENT_COLUMN: &str = "content";

/// Reads the `content` column of a fixed standard-SQL query, one result page at a time.
pub struct BigQuerySource {
    client: Arc<BigQueryClient>,
    query: String,
    page_size: u32,
    /// Deadline for the query job to finish. Page fetches afterwards are not limited.
    timeout: Duration,
}

/// Where the next page comes from.
enum Cursor {
    Start,
    Next {
        job: JobReference,
        column: usize,
        token: String,
        offset: usize,
    },
    Done,
}

impl BigQuerySource {
    pub fn new(client: Arc<BigQueryClient>, config: &PipelineConfig) -> Self {
        Self::with_query(
            client,
            config.source_query.clone(),
            config.page_size,
            Duration::from_secs(config.job_timeout_secs),
        )
    }

    pub fn with_query(
        client: Arc<BigQueryClient>,
        query: String,
        page_size: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            query,
            page_size: page_size.max(1),
            timeout,
        }
    }

    /// Submit the query and return its first complete page.
    async fn run_query(&self) -> Result<(JobReference, QueryResponse)> {
        tracing::info!(query = %self.query, "Submitting source query");

        let request = QueryRequest {
            query: self.query.clone(),
            use_legacy_sql: false,
            location: self.client.location().map(str::to_string),
            max_results: Some(self.page_size),
            timeout_ms: QUERY_WAIT_MS,
        };

        let page = self.client.query(&request).await?;
        let job = page.job_reference.clone().ok_or_else(|| {
            SluiceError::Source("Query response is missing jobReference".into())
        })?;

        let page = if page.job_complete {
            page
        } else {
            timed(self.timeout, &job.job_id, self.wait_for_results(&job)).await??
        };

        if let Some(total) = &page.total_rows {
            tracing::info!(job_id = %job.job_id, total_rows = %total, "Source query complete");
        }
        Ok((job, page))
    }

    async fn wait_for_results(&self, job: &JobReference) -> Result<QueryResponse> {
        loop {
            tracing::debug!(job_id = %job.job_id, "Source query still running");
            let page = self
                .client
                .get_query_results(job, None, Some(self.page_size))
                .await?;
            if page.job_complete {
                return Ok(page);
            }
        }
    }

    async fn next_page(&self, cursor: Cursor) -> Result<Option<(Vec<InputRecord>, Cursor)>> {
        let (job, column, offset, page) = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => {
                let (job, page) = self.run_query().await?;
                let column = content_column(page.schema.as_ref())?;
                (job, column, 0, page)
            }
            Cursor::Next {
                job,
                column,
                token,
                offset,
            } => {
                let page = self
                    .client
                    .get_query_results(&job, Some(&token), Some(self.page_size))
                    .await?;
                (job, column, offset, page)
            }
        };

        let records = page
            .rows
            .iter()
            .enumerate()
            .map(|(n, row)| row_to_record(row, column, offset + n))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(job_id = %job.job_id, offset, rows = records.len(), "Read source page");

        let next = match page.page_token.filter(|t| !t.is_empty()) {
            Some(token) => Cursor::Next {
                job,
                column,
                token,
                offset: offset + records.len(),
            },
            None => Cursor::Done,
        };
        Ok(Some((records, next)))
    }
}

fn content_column(schema: Option<&TableSchema>) -> Result<usize> {
    let schema = schema
        .ok_or_else(|| SluiceError::Source("Query result has no schema".into()))?;
    schema
        .fields
        .iter()
        .position(|f| f.name.eq_ignore_ascii_case(CONTENT_COLUMN))
        .ok_or_else(|| {
            SluiceError::Source(format!(
                "Query result has no '{CONTENT_COLUMN}' column (got {:?})",
                schema.field_names()
            ))
        })
}

fn row_to_record(row: &TableRow, index: usize, row_number: usize) -> Result<InputRecord> {
    let cell = row.f.get(index).ok_or_else(|| {
        SluiceError::Source(format!("Row {row_number} has no cell at column {index}"))
    })?;
    match &cell.v {
        serde_json::Value::String(s) => Ok(InputRecord::new(s.clone())),
        serde_json::Value::Null => Err(SluiceError::Source(format!(
            "Row {row_number} has NULL {CONTENT_COLUMN}"
        ))),
        other => Err(SluiceError::Source(format!(
            "Row {row_number} has non-string {CONTENT_COLUMN}: {other}"
        ))),
    }
}

impl SourceReader for BigQuerySource {
    fn pages(&self) -> RecordPages<'_> {
        stream::try_unfold(Cursor::Start, move |cursor| self.next_page(cursor)).boxed()
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use sluice_core::config::PipelineConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::record::OutputRecord;
use sluice_core::warehouse::{
    CreateDisposition, SinkWriter, TableRef, TableSchema, WriteDisposition, WriteSession,
    WriteSummary,
};

use crate::client::{BigQueryClient, Job, JobConfiguration, JobReference, LoadConfiguration};

const SOURCE_FORMAT: &str = "NEWLINE_DELIMITED_JSON";

/// Writes the whole run's rows into one table with a single load job.
pub struct BigQuerySink {
    client: Arc<BigQueryClient>,
    table: TableRef,
    schema: TableSchema,
    write_disposition: WriteDisposition,
    create_disposition: CreateDisposition,
    timeout: Duration,
}

impl BigQuerySink {
    pub fn new(client: Arc<BigQueryClient>, config: &PipelineConfig) -> Result<Self> {
        let sink = Self {
            client,
            table: config.destination()?,
            schema: config.schema()?,
            write_disposition: config.write_disposition,
            create_disposition: config.create_disposition,
            timeout: Duration::from_secs(config.job_timeout_secs),
        };
        sink.schema.ensure_output_columns()?;
        Ok(sink)
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    fn load_job(&self, job_id: &str) -> Job {
        Job {
            job_reference: Some(JobReference {
                project_id: self.client.project().to_string(),
                job_id: job_id.to_string(),
                location: self.client.location().map(str::to_string),
            }),
            configuration: Some(JobConfiguration {
                load: Some(LoadConfiguration {
                    destination_table: self.table.clone(),
                    schema: self.schema.clone(),
                    source_format: SOURCE_FORMAT.to_string(),
                    write_disposition: self.write_disposition,
                    create_disposition: self.create_disposition,
                }),
            }),
            status: None,
        }
    }
}

/// Append rows as newline-delimited JSON.
fn append_ndjson(data: &mut Vec<u8>, rows: &[OutputRecord]) -> Result<()> {
    for row in rows {
        serde_json::to_writer(&mut *data, row)?;
        data.push(b'\n');
    }
    Ok(())
}

impl SinkWriter for BigQuerySink {
    fn begin(&self) -> Result<Box<dyn WriteSession + '_>> {
        Ok(Box::new(LoadSession {
            sink: self,
            data: Vec::new(),
            rows: 0,
        }))
    }
}

/// Rows encoded as they arrive; uploaded as one load job on commit.
struct LoadSession<'a> {
    sink: &'a BigQuerySink,
    data: Vec<u8>,
    rows: u64,
}

#[async_trait]
impl<'a> WriteSession for LoadSession<'a> {
    fn append(&mut self, rows: &[OutputRecord]) -> Result<()> {
        append_ndjson(&mut self.data, rows)?;
        self.rows += rows.len() as u64;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.rows
    }

    async fn commit(&mut self) -> Result<WriteSummary> {
        let sink = self.sink;
        let rows = std::mem::take(&mut self.rows);
        let data = std::mem::take(&mut self.data);
        let job_id = format!("sluice_load_{}", Uuid::new_v4().simple());

        tracing::info!(
            table = %sink.table,
            rows,
            payload_bytes = data.len(),
            job_id = %job_id,
            write_disposition = ?sink.write_disposition,
            create_disposition = ?sink.create_disposition,
            "Starting load job"
        );

        let started = sink
            .client
            .insert_load_job(&sink.load_job(&job_id), data)
            .await
            .map_err(|e| SluiceError::Sink(format!("Failed to start load job {job_id}: {e}")))?;

        let done = sink.client.wait_for_job(started, sink.timeout).await?;

        if let Some(status) = &done.status {
            for err in &status.errors {
                tracing::warn!(
                    job_id = %job_id,
                    reason = ?err.reason,
                    message = ?err.message,
                    "Load job reported a non-fatal error"
                );
            }
        }

        tracing::info!(table = %sink.table, rows, job_id = %job_id, "Load job complete");

        Ok(WriteSummary {
            table: sink.table.clone(),
            rows_written: rows,
            job_id: Some(job_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenProvider;
    use wiremock::matchers::{body_string_contains, header_regex, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink_for(server: &MockServer) -> BigQuerySink {
        let client = Arc::new(BigQueryClient::with_api_base(
            &server.uri(),
            "proj",
            None,
            TokenProvider::fixed("tok"),
        ));
        let config = PipelineConfig {
            destination_table: "proj.ds.results".into(),
            job_timeout_secs: 5,
            ..Default::default()
        };
        BigQuerySink::new(client, &config).unwrap()
    }

    fn done_job() -> serde_json::Value {
        serde_json::json!({
            "jobReference": {"projectId": "proj", "jobId": "sluice_load_x"},
            "status": {"state": "DONE"}
        })
    }

    #[test]
    fn ndjson_has_one_line_per_row() {
        let rows = vec![
            OutputRecord {
                input: "a\nb".into(),
                output: "c".into(),
            },
            OutputRecord {
                input: "d".into(),
                output: "No inference text".into(),
            },
        ];
        let mut data = Vec::new();
        append_ndjson(&mut data, &rows[..1]).unwrap();
        append_ndjson(&mut data, &rows[1..]).unwrap();
        let text = String::from_utf8(data).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"input":"a\nb","output":"c"}"#);
        assert_eq!(lines[1], r#"{"input":"d","output":"No inference text"}"#);
    }

    #[test]
    fn rejects_schema_without_output_column() {
        let client = Arc::new(BigQueryClient::with_api_base(
            "http://127.0.0.1:9",
            "proj",
            None,
            TokenProvider::fixed("tok"),
        ));
        let config = PipelineConfig {
            destination_schema: "input:STRING, answer:STRING".into(),
            ..Default::default()
        };
        assert!(matches!(
            BigQuerySink::new(client, &config),
            Err(SluiceError::Config(_))
        ));
    }

    #[test]
    fn rejects_non_string_columns() {
        let client = Arc::new(BigQueryClient::with_api_base(
            "http://127.0.0.1:9",
            "proj",
            None,
            TokenProvider::fixed("tok"),
        ));
        let config = PipelineConfig {
            destination_schema: "input:INTEGER, output:BYTES".into(),
            ..Default::default()
        };
        assert!(matches!(
            BigQuerySink::new(client, &config),
            Err(SluiceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn session_uploads_only_on_commit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .and(body_string_contains("{\"input\":\"p1\",\"output\":\"o1\"}\n{\"input\":\"p2\",\"output\":\"o2\"}\n"))
            .respond_with(ResponseTemplate::new(200).set_body_json(done_job()))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink_for(&server);
        let mut session = sink.begin().unwrap();
        session
            .append(&[OutputRecord {
                input: "p1".into(),
                output: "o1".into(),
            }])
            .unwrap();
        session
            .append(&[OutputRecord {
                input: "p2".into(),
                output: "o2".into(),
            }])
            .unwrap();
        assert_eq!(session.len(), 2);
        assert!(server.received_requests().await.unwrap().is_empty());

        let summary = session.commit().await.unwrap();
        assert_eq!(summary.rows_written, 2);
    }

    #[tokio::test]
    async fn abandoned_session_sends_nothing() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(done_job()))
            .expect(0)
            .mount(&server)
            .await;

        let sink = sink_for(&server);
        let mut session = sink.begin().unwrap();
        session
            .append(&[OutputRecord {
                input: "a".into(),
                output: "b".into(),
            }])
            .unwrap();
        drop(session);
    }

    #[tokio::test]
    async fn submits_truncating_load_job() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .and(query_param("uploadType", "multipart"))
            .and(header_regex("content-type", "^multipart/related; boundary=sluice_"))
            .and(body_string_contains(r#""writeDisposition":"WRITE_TRUNCATE""#))
            .and(body_string_contains(r#""createDisposition":"CREATE_IF_NEEDED""#))
            .and(body_string_contains(r#""sourceFormat":"NEWLINE_DELIMITED_JSON""#))
            .and(body_string_contains(
                r#""destinationTable":{"projectId":"proj","datasetId":"ds","tableId":"results"}"#,
            ))
            .and(body_string_contains(r#"{"input":"ping","output":"No inference text"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(done_job()))
            .expect(1)
            .mount(&server)
            .await;

        let rows = vec![OutputRecord {
            input: "ping".into(),
            output: "No inference text".into(),
        }];
        let summary = sink_for(&server).write(&rows).await.unwrap();
        assert_eq!(summary.rows_written, 1);
        assert_eq!(summary.table.to_string(), "proj.ds.results");
        assert!(summary.job_id.unwrap().starts_with("sluice_load_"));
    }

    #[tokio::test]
    async fn empty_write_still_submits_job() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .and(body_string_contains(r#""schema":{"fields":[{"name":"input","type":"STRING","mode":"NULLABLE"},{"name":"output","type":"STRING","mode":"NULLABLE"}]}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(done_job()))
            .expect(1)
            .mount(&server)
            .await;

        let summary = sink_for(&server).write(&[]).await.unwrap();
        assert_eq!(summary.rows_written, 0);
    }

    #[tokio::test]
    async fn polls_until_done() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobReference": {"projectId": "proj", "jobId": "sluice_load_x"},
                "status": {"state": "RUNNING"}
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/sluice_load_x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(done_job()))
            .expect(1)
            .mount(&server)
            .await;

        let summary = sink_for(&server)
            .write(&[OutputRecord {
                input: "a".into(),
                output: "b".into(),
            }])
            .await
            .unwrap();
        assert_eq!(summary.rows_written, 1);
    }

    #[tokio::test]
    async fn failed_job_is_fatal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobReference": {"projectId": "proj", "jobId": "sluice_load_x"},
                "status": {
                    "state": "DONE",
                    "errorResult": {"reason": "invalid", "message": "Provided Schema does not match Table"}
                }
            })))
            .mount(&server)
            .await;

        let err = sink_for(&server).write(&[]).await.unwrap_err();
        assert!(
            matches!(err, SluiceError::Job { ref message, .. } if message.contains("does not match"))
        );
    }

    #[tokio::test]
    async fn rejected_upload_is_sink_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not found: Dataset proj:ds"))
            .mount(&server)
            .await;

        let err = sink_for(&server).write(&[]).await.unwrap_err();
        assert!(matches!(err, SluiceError::Sink(ref m) if m.contains("Not found")));
    }
}

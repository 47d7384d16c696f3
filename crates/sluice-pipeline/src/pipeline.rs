use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sluice_core::error::{Result, SluiceError};
use sluice_core::extract::{extract, Extraction};
use sluice_core::inference::{InferenceHandler, InferenceResult};
use sluice_core::record::{InputRecord, OutputRecord};
use sluice_core::warehouse::{SinkWriter, SourceReader};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub empty_inferences: u64,
    pub extraction_errors: u64,
}

#[derive(Default)]
struct Tally {
    empty: u64,
    failed: u64,
}

/// Read → infer → extract → write, once, with no retries.
///
/// Source pages flow through the handler one at a time and are appended to a
/// single sink write session. Row-level extraction problems are written into
/// the `output` column; any failure from the source, the inference handler or
/// the sink aborts the run, and nothing is committed unless every page made it.
pub struct BatchInferencePipeline {
    source: Arc<dyn SourceReader>,
    handler: Arc<dyn InferenceHandler>,
    sink: Arc<dyn SinkWriter>,
}

impl BatchInferencePipeline {
    pub fn new(
        source: Arc<dyn SourceReader>,
        handler: Arc<dyn InferenceHandler>,
        sink: Arc<dyn SinkWriter>,
    ) -> Self {
        Self {
            source,
            handler,
            sink,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        tracing::info!(run_id = %run_id, model = %self.handler.model_id(), "Starting pipeline run");

        let mut pages = self.source.pages();
        let mut session = self.sink.begin()?;
        let mut tally = Tally::default();
        let mut page_count = 0u64;
        let mut rows_read = 0u64;

        while let Some(page) = pages.next().await {
            let page = page?;
            if page.is_empty() {
                continue;
            }
            rows_read += page.len() as u64;

            let outputs = self.infer_page(run_id, page_count, &page, &mut tally).await?;
            session.append(&outputs)?;
            page_count += 1;

            tracing::debug!(
                run_id = %run_id,
                page = page_count,
                done = session.len(),
                "Page inferred"
            );
        }
        drop(pages);

        let summary = session.commit().await?;

        let run = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages: page_count,
            rows_read,
            rows_written: summary.rows_written,
            empty_inferences: tally.empty,
            extraction_errors: tally.failed,
        };

        tracing::info!(
            run_id = %run_id,
            table = %summary.table,
            pages = run.pages,
            rows_read = run.rows_read,
            rows_written = run.rows_written,
            empty_inferences = run.empty_inferences,
            extraction_errors = run.extraction_errors,
            "Pipeline run complete"
        );

        Ok(run)
    }

    /// One handler call per page; exactly one output row per input row.
    async fn infer_page(
        &self,
        run_id: Uuid,
        page_number: u64,
        page: &[InputRecord],
        tally: &mut Tally,
    ) -> Result<Vec<OutputRecord>> {
        let batch = prompts(page);
        let results = self.handler.run_inference(&batch).await?;

        if results.len() != batch.len() {
            return Err(SluiceError::Inference(format!(
                "Page {page_number}: handler returned {} results for {} prompts",
                results.len(),
                batch.len()
            )));
        }

        Ok(results
            .into_iter()
            .map(|result| to_output(run_id, result, tally))
            .collect())
    }
}

fn to_output(run_id: Uuid, result: InferenceResult, tally: &mut Tally) -> OutputRecord {
    let extraction = extract(&result);
    match &extraction {
        Extraction::Text(_) => {}
        Extraction::Empty => tally.empty += 1,
        Extraction::Failed(message) => {
            tally.failed += 1;
            tracing::warn!(run_id = %run_id, error = %message, "Failed to extract inference text");
        }
    }
    tracing::trace!(row = %result, "Formatted inference");
    OutputRecord::from_extraction(result.example, extraction)
}

/// Prompts in the order the source produced them.
pub fn prompts(records: &[InputRecord]) -> Vec<String> {
    records.iter().map(|r| r.content.clone()).collect()
}

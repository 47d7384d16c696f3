use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::record::{InputRecord, OutputRecord};

/// Fully qualified `project.dataset.table` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(rename = "projectId")]
    pub project: String,
    #[serde(rename = "datasetId")]
    pub dataset: String,
    #[serde(rename = "tableId")]
    pub table: String,
}

impl FromStr for TableRef {
    type Err = SluiceError;

    /// Accepts `project.dataset.table`, the legacy `project:dataset.table`, and
    /// domain-scoped projects such as `example.com:proj.dataset.table`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            SluiceError::Config(format!(
                "Invalid table reference '{s}', expected project.dataset.table"
            ))
        };
        let trimmed = s.trim().trim_matches('`');

        let (head, table) = trimmed.rsplit_once('.').ok_or_else(invalid)?;
        let (project, dataset) = head
            .rsplit_once(|c| c == '.' || c == ':')
            .ok_or_else(invalid)?;

        let project_ok = match project.split_once(':') {
            Some((domain, name)) => {
                !domain.is_empty() && !name.is_empty() && !name.contains(|c| c == '.' || c == ':')
            }
            None => !project.is_empty() && !project.contains('.'),
        };
        if !project_ok || dataset.is_empty() || table.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "NULLABLE".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    /// Parse the compact `name:TYPE, name:TYPE` notation.
    pub fn parse(s: &str) -> Result<Self> {
        let mut fields = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, field_type) = part.split_once(':').ok_or_else(|| {
                SluiceError::Config(format!("Schema field '{part}' is missing a type"))
            })?;
            let (name, field_type) = (name.trim(), field_type.trim());
            if name.is_empty() || field_type.is_empty() {
                return Err(SluiceError::Config(format!("Malformed schema field '{part}'")));
            }
            fields.push(FieldSchema {
                name: name.to_string(),
                field_type: field_type.to_uppercase(),
                mode: default_mode(),
            });
        }
        if fields.is_empty() {
            return Err(SluiceError::Config("Schema has no fields".into()));
        }
        Ok(Self { fields })
    }

    /// The fixed `input:STRING, output:STRING` result schema.
    pub fn output_schema() -> Self {
        Self {
            fields: ["input", "output"]
                .iter()
                .map(|name| FieldSchema {
                    name: name.to_string(),
                    field_type: "STRING".to_string(),
                    mode: default_mode(),
                })
                .collect(),
        }
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Output rows serialize as `{input, output}` strings, so the destination
    /// must have exactly those two columns, both `STRING`.
    pub fn ensure_output_columns(&self) -> Result<()> {
        let mut columns: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.field_type.as_str()))
            .collect();
        columns.sort_unstable();
        if columns != [("input", "STRING"), ("output", "STRING")] {
            return Err(SluiceError::Config(format!(
                "Destination schema must be exactly input:STRING, output:STRING, got {columns:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    WriteTruncate,
    WriteAppend,
    WriteEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateDisposition {
    CreateIfNeeded,
    CreateNever,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSummary {
    pub table: TableRef,
    pub rows_written: u64,
    pub job_id: Option<String>,
}

/// Pages of input rows in source order. Each page is fetched when polled.
pub type RecordPages<'a> = BoxStream<'a, Result<Vec<InputRecord>>>;

/// Produces the pipeline's input rows from a fixed query.
pub trait SourceReader: Send + Sync {
    /// A finite, lazily fetched sequence of row pages. An `Err` item ends the read.
    fn pages(&self) -> RecordPages<'_>;
}

/// Persists the pipeline's output rows to a fixed destination.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    /// Start a write. Nothing reaches the destination before `commit`.
    fn begin(&self) -> Result<Box<dyn WriteSession + '_>>;

    /// Write a complete set of rows in one session.
    async fn write(&self, rows: &[OutputRecord]) -> Result<WriteSummary> {
        let mut session = self.begin()?;
        session.append(rows)?;
        session.commit().await
    }
}

/// Rows accumulated for a single destination write.
#[async_trait]
pub trait WriteSession: Send {
    fn append(&mut self, rows: &[OutputRecord]) -> Result<()>;

    /// Rows appended so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the destination with the appended rows.
    async fn commit(&mut self) -> Result<WriteSummary>;
}

pub mod config;
pub mod error;
pub mod extract;
pub mod inference;
pub mod record;
pub mod warehouse;

pub use config::PipelineConfig;
pub use error::{Result, SluiceError};
pub use extract::{extract, Extraction};
pub use inference::{Choice, Completion, InferenceHandler, InferenceResult};
pub use record::{InputRecord, OutputRecord, EXTRACTION_ERROR_PREFIX, NO_INFERENCE_TEXT};
pub use warehouse::{
    CreateDisposition, FieldSchema, RecordPages, SinkWriter, SourceReader, TableRef, TableSchema,
    WriteDisposition, WriteSession, WriteSummary,
};

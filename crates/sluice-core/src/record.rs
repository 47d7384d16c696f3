use serde::{Deserialize, Serialize};

use crate::extract::Extraction;

/// Output value written when the completion carried no choices.
pub const NO_INFERENCE_TEXT: &str = "No inference text";

/// Prefix of the output value written when reading the completion failed.
pub const EXTRACTION_ERROR_PREFIX: &str = "Error extracting inference: ";

/// One source row. Only the `content` column is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub content: String,
}

impl InputRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// One sink row. Field names are the destination column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub input: String,
    pub output: String,
}

impl OutputRecord {
    /// Collapse every extraction outcome into the same two-column shape.
    pub fn from_extraction(input: String, extraction: Extraction) -> Self {
        let output = match extraction {
            Extraction::Text(text) => text,
            Extraction::Empty => NO_INFERENCE_TEXT.to_string(),
            Extraction::Failed(message) => format!("{EXTRACTION_ERROR_PREFIX}{message}"),
        };
        Self { input, output }
    }
}

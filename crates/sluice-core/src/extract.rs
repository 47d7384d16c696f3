use crate::inference::InferenceResult;

/// Outcome of reading the answer text out of a single completion.
///
/// Row-level failures stop here: every variant becomes an `OutputRecord`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Text(String),
    Empty,
    Failed(String),
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        matches!(self, Extraction::Empty)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Extraction::Failed(_))
    }
}

/// Read the first choice's text, if there is one.
pub fn extract(result: &InferenceResult) -> Extraction {
    match result.inference.choices.first() {
        None => Extraction::Empty,
        Some(choice) => match &choice.text {
            Some(text) => Extraction::Text(text.clone()),
            None => Extraction::Failed(format!("choice {} has no text", choice.index)),
        },
    }
}

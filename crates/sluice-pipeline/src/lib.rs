mod pipeline;

pub use pipeline::{prompts, BatchInferencePipeline, RunSummary};

mod server;
mod vllm;

pub use server::{server_args, VllmServer, DEFAULT_STARTUP_TIMEOUT};
pub use vllm::VllmCompletionsHandler;

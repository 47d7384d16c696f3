pub mod auth;
pub mod client;
pub mod sink;
pub mod source;

pub use auth::TokenProvider;
pub use client::BigQueryClient;
pub use sink::BigQuerySink;
pub use source::BigQuerySource;

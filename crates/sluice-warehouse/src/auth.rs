use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use sluice_core::error::{Result, SluiceError};

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the metadata server says the token expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

enum TokenSource {
    Static(String),
    Metadata { url: String },
}

/// Supplies OAuth bearer tokens for the BigQuery REST API.
///
/// Either a fixed token handed in through configuration, or a token fetched
/// from the compute metadata server and cached until shortly before expiry.
pub struct TokenProvider {
    source: TokenSource,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Static(token.into()),
            http: reqwest::Client::new(),
            cached: RwLock::new(None),
        }
    }

    pub fn metadata_server() -> Self {
        Self::metadata_at(METADATA_TOKEN_URL)
    }

    pub fn metadata_at(url: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Metadata { url: url.into() },
            http: reqwest::Client::new(),
            cached: RwLock::new(None),
        }
    }

    pub async fn token(&self) -> Result<String> {
        let url = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata { url } => url,
        };

        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let mut guard = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        tracing::debug!(url = %url, "Fetching access token from metadata server");

        let response = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| SluiceError::Config(format!("Metadata server unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(SluiceError::Config(format!(
                "Metadata server returned status {status}: {body}"
            )));
        }

        let fetched: MetadataToken = response
            .json()
            .await
            .map_err(|e| SluiceError::Config(format!("Failed to parse metadata token: {e}")))?;

        let lifetime = (fetched.expires_in - EXPIRY_MARGIN_SECS).max(0);
        let token = fetched.access_token.clone();
        *guard = Some(CachedToken {
            token: fetched.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        });

        tracing::info!(expires_in = fetched.expires_in, "Obtained access token");
        Ok(token)
    }
}

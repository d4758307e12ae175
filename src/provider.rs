//! Client for the proxy-rental provider API
//!
//! The provider hands out one upstream endpoint per credential and
//! replaces it on demand. Every response arrives in a
//! `{success, message, data}` envelope; a `success: false` envelope is
//! surfaced verbatim as an [`FleetError::UpstreamProvider`].

use crate::config::ProviderConfig;
use crate::error::{FleetError, Result};
use crate::model::UpstreamInfo;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Upstream provider collaborator
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Current endpoint rented for the credential, without rotating it
    async fn fetch_current(&self, credential: &str) -> Result<UpstreamInfo>;

    /// Rotate the credential to a fresh endpoint in the given region
    async fn fetch_new(&self, credential: &str, region: &str) -> Result<UpstreamInfo>;

    /// Release the credential's rented endpoint
    async fn release(&self, credential: &str) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    message: Option<String>,
    data: Option<T>,
}

/// HTTP implementation of the provider API
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FleetError::UpstreamProvider(format!("client setup: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| FleetError::UpstreamProvider(e.to_string()))?;

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| FleetError::UpstreamProvider(format!("malformed response: {}", e)))?;

        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "unknown provider error".to_string());
            return Err(FleetError::UpstreamProvider(message));
        }

        envelope
            .data
            .ok_or_else(|| FleetError::UpstreamProvider("response missing data".to_string()))
    }
}

#[async_trait]
impl UpstreamProvider for HttpProvider {
    async fn fetch_current(&self, credential: &str) -> Result<UpstreamInfo> {
        self.get("proxies/current", &[("key", credential)]).await
    }

    async fn fetch_new(&self, credential: &str, region: &str) -> Result<UpstreamInfo> {
        self.get("proxies/new", &[("key", credential), ("region", region)])
            .await
    }

    async fn release(&self, credential: &str) -> Result<bool> {
        self.get("proxies/out", &[("key", credential)]).await
    }
}

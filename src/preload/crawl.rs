//! Bounded fetching for the preload pass.

use async_trait::async_trait;
use reqwest::{Client, header::CONTENT_LENGTH};
use tracing::debug;
use url::Url;

use crate::infra::{
    error::InfraError,
    http::{ClientLimits, build_client},
};

use super::PreloadError;

/// Network access used by the recommendation engine.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Body of a 2xx response.
    async fn fetch_text(&self, url: &Url) -> Result<String, PreloadError>;

    /// Declared size of the resource, when the server reports one.
    async fn content_length(&self, url: &Url) -> Option<u64>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn with_limits(limits: ClientLimits) -> Result<Self, InfraError> {
        Ok(Self::new(build_client(limits)?))
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &Url) -> Result<String, PreloadError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| PreloadError::fetch(url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PreloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .text()
            .await
            .map_err(|err| PreloadError::fetch(url, err))
    }

    async fn content_length(&self, url: &Url) -> Option<u64> {
        let response = match self.client.head(url.clone()).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(
                    target = "preload::crawl",
                    url = %url,
                    status = %response.status(),
                    "Size check rejected"
                );
                return None;
            }
            Err(err) => {
                debug!(target = "preload::crawl", url = %url, error = %err, "Size check failed");
                return None;
            }
        };
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }
}

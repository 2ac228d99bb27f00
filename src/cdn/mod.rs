//! CDN purge fan-out.
//!
//! Providers are called one after another; each outcome is recorded independently, so a failing
//! provider never prevents the remaining ones from being attempted.

mod bunny;
mod cloudflare;

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CdnSettings;
use crate::infra::{
    error::InfraError,
    http::{ClientLimits, build_client},
};

pub use bunny::BunnyProvider;
pub use cloudflare::CloudflareProvider;

const METRIC_CDN_PURGE_FAILURE: &str = "spry_cdn_purge_failure_total";
const CDN_MAX_REDIRECTS: usize = 2;
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    All,
    /// Absolute URLs.
    Urls(Vec<String>),
}

impl PurgeScope {
    fn label(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Urls(_) => "urls",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderResult {
    pub provider: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CdnError {
    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider rejected the purge: {0}")]
    Rejected(String),
    #[error("invalid purge endpoint: {0}")]
    Endpoint(String),
    #[error("purged {purged} of {total} url(s) before failing: {source}")]
    Partial {
        purged: usize,
        total: usize,
        source: Box<CdnError>,
    },
}

impl CdnError {
    pub(crate) fn status(status: reqwest::StatusCode, body: &str) -> Self {
        let mut body = body.trim().to_string();
        if body.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Self::Status {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
pub trait CdnProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Purge `scope`, returning a human-readable success message.
    async fn purge(&self, scope: &PurgeScope) -> Result<String, CdnError>;
}

#[derive(Clone, Default)]
pub struct CdnGateway {
    providers: Vec<Arc<dyn CdnProvider>>,
}

impl std::fmt::Debug for CdnGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnGateway")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CdnGateway {
    pub fn new(providers: Vec<Arc<dyn CdnProvider>>) -> Self {
        Self { providers }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &CdnSettings) -> Result<Self, InfraError> {
        let mut providers: Vec<Arc<dyn CdnProvider>> = Vec::new();
        if settings.cloudflare.is_none() && settings.bunny.is_none() {
            return Ok(Self::disabled());
        }

        let client = build_client(ClientLimits::new(settings.timeout, CDN_MAX_REDIRECTS))?;
        if let Some(cloudflare) = settings.cloudflare.as_ref() {
            providers.push(Arc::new(CloudflareProvider::new(
                client.clone(),
                cloudflare,
            )));
        }
        if let Some(bunny) = settings.bunny.as_ref() {
            providers.push(Arc::new(BunnyProvider::new(client, bunny)));
        }
        Ok(Self::new(providers))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub async fn purge(&self, scope: PurgeScope) -> Vec<ProviderResult> {
        if let PurgeScope::Urls(urls) = &scope
            && urls.is_empty()
        {
            return Vec::new();
        }

        let mut results = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let outcome = provider.purge(&scope).await;
            let result = match outcome {
                Ok(message) => {
                    info!(
                        provider = provider.name(),
                        scope = scope.label(),
                        result = "ok",
                        "CDN purge completed"
                    );
                    ProviderResult {
                        provider: provider.name().to_string(),
                        success: true,
                        message,
                    }
                }
                Err(err) => {
                    warn!(
                        provider = provider.name(),
                        scope = scope.label(),
                        result = "failed",
                        error = %err,
                        "CDN purge failed"
                    );
                    counter!(METRIC_CDN_PURGE_FAILURE, "provider" => provider.name().to_string())
                        .increment(1);
                    ProviderResult {
                        provider: provider.name().to_string(),
                        success: false,
                        message: err.to_string(),
                    }
                }
            };
            results.push(result);
        }
        results
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingProvider;
    use super::*;

    #[tokio::test]
    async fn failing_provider_does_not_stop_the_others() {
        let first = RecordingProvider::failing("first", "zone locked");
        let second = RecordingProvider::ok("second");
        let gateway = CdnGateway::new(vec![first.clone(), second.clone()]);

        let results = gateway.purge(PurgeScope::All).await;

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert_eq!(results[0].message, "provider rejected the purge: zone locked");
        assert!(results[1].success);
        assert_eq!(second.calls(), vec![PurgeScope::All]);
    }

    #[tokio::test]
    async fn empty_url_scope_skips_providers() {
        let provider = RecordingProvider::ok("only");
        let gateway = CdnGateway::new(vec![provider.clone()]);

        assert!(gateway.purge(PurgeScope::Urls(Vec::new())).await.is_empty());
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn disabled_settings_build_an_empty_gateway() {
        let gateway = CdnGateway::from_settings(&CdnSettings::default()).expect("gateway");
        assert!(gateway.is_empty());
    }

    #[test]
    fn status_error_truncates_long_bodies() {
        let body = "é".repeat(400);
        match CdnError::status(reqwest::StatusCode::BAD_GATEWAY, &body) {
            CdnError::Status { status, body } => {
                assert_eq!(status, 502);
                assert!(body.len() <= ERROR_BODY_LIMIT);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

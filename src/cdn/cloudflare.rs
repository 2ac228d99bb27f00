use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::CloudflareSettings;

use super::{CdnError, CdnProvider, PurgeScope};

/// Cloudflare accepts at most this many files per purge call.
const FILES_PER_REQUEST: usize = 30;

pub struct CloudflareProvider {
    client: Client,
    api_base: String,
    zone_id: Option<String>,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl CloudflareProvider {
    pub fn new(client: Client, settings: &CloudflareSettings) -> Self {
        Self {
            client,
            api_base: settings.api_base.clone(),
            zone_id: settings.zone_id.clone(),
            api_token: settings.api_token.clone(),
        }
    }

    async fn send(
        &self,
        endpoint: &str,
        token: &str,
        body: serde_json::Value,
    ) -> Result<(), CdnError> {
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(CdnError::status(status, &text));
        }

        let envelope: ApiEnvelope = serde_json::from_str(&text)
            .map_err(|err| CdnError::Rejected(format!("unreadable response: {err}")))?;
        if envelope.success {
            return Ok(());
        }
        let reasons = envelope
            .errors
            .iter()
            .map(|error| format!("{} ({})", error.message, error.code))
            .collect::<Vec<_>>()
            .join("; ");
        Err(CdnError::Rejected(reasons))
    }
}

#[async_trait]
impl CdnProvider for CloudflareProvider {
    fn name(&self) -> &str {
        "cloudflare"
    }

    async fn purge(&self, scope: &PurgeScope) -> Result<String, CdnError> {
        let (Some(zone_id), Some(token)) = (self.zone_id.as_deref(), self.api_token.as_deref())
        else {
            return Err(CdnError::MissingCredentials(
                "cloudflare needs zone_id and api_token",
            ));
        };
        let endpoint = format!("{}/zones/{zone_id}/purge_cache", self.api_base);

        match scope {
            PurgeScope::All => {
                self.send(&endpoint, token, json!({ "purge_everything": true }))
                    .await?;
                Ok("purged everything".to_string())
            }
            PurgeScope::Urls(urls) => {
                let mut purged = 0;
                for chunk in urls.chunks(FILES_PER_REQUEST) {
                    if let Err(err) = self.send(&endpoint, token, json!({ "files": chunk })).await {
                        if purged == 0 {
                            return Err(err);
                        }
                        return Err(CdnError::Partial {
                            purged,
                            total: urls.len(),
                            source: Box::new(err),
                        });
                    }
                    purged += chunk.len();
                }
                Ok(format!("purged {} url(s)", urls.len()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn provider(server: &MockServer) -> CloudflareProvider {
        CloudflareProvider::new(
            Client::new(),
            &CloudflareSettings {
                api_base: server.base_url(),
                zone_id: Some("zone-1".to_string()),
                api_token: Some("cf-token".to_string()),
            },
        )
    }

    fn page_urls(count: usize) -> Vec<String> {
        (0..count)
            .map(|n| format!("https://example.test/page-{n:02}/"))
            .collect()
    }

    #[tokio::test]
    async fn later_chunk_failure_reports_progress() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/zones/zone-1/purge_cache")
                    .body_includes("/page-00/");
                then.status(200).json_body(json!({ "success": true }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/zones/zone-1/purge_cache")
                    .body_includes("/page-30/");
                then.status(200).json_body(json!({
                    "success": false,
                    "errors": [{ "code": 1015, "message": "rate limited" }]
                }));
            })
            .await;

        let err = provider(&server)
            .purge(&PurgeScope::Urls(page_urls(35)))
            .await
            .expect_err("second chunk fails");

        first.assert_async().await;
        assert!(matches!(err, CdnError::Partial { purged: 30, total: 35, .. }));
        let message = err.to_string();
        assert!(message.contains("purged 30 of 35 url(s)"));
        assert!(message.contains("rate limited (1015)"));
    }

    #[tokio::test]
    async fn first_chunk_failure_is_reported_as_is() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/zones/zone-1/purge_cache");
                then.status(403).body("forbidden");
            })
            .await;

        let err = provider(&server)
            .purge(&PurgeScope::Urls(page_urls(3)))
            .await
            .expect_err("purge fails");

        assert!(matches!(err, CdnError::Status { status: 403, .. }));
    }
}

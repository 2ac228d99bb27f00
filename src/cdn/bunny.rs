use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::config::BunnySettings;

use super::{CdnError, CdnProvider, PurgeScope};

const ACCESS_KEY_HEADER: &str = "AccessKey";

pub struct BunnyProvider {
    client: Client,
    api_base: String,
    pull_zone_id: Option<String>,
    access_key: Option<String>,
}

impl BunnyProvider {
    pub fn new(client: Client, settings: &BunnySettings) -> Self {
        Self {
            client,
            api_base: settings.api_base.clone(),
            pull_zone_id: settings.pull_zone_id.clone(),
            access_key: settings.access_key.clone(),
        }
    }

    async fn post(&self, endpoint: Url, access_key: &str) -> Result<(), CdnError> {
        let response = self
            .client
            .post(endpoint)
            .header(ACCESS_KEY_HEADER, access_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(CdnError::status(status, &text))
    }

    fn endpoint(&self, path: &str) -> Result<Url, CdnError> {
        let raw = format!("{}/{path}", self.api_base);
        Url::parse(&raw).map_err(|err| CdnError::Endpoint(format!("{raw}: {err}")))
    }
}

#[async_trait]
impl CdnProvider for BunnyProvider {
    fn name(&self) -> &str {
        "bunny"
    }

    async fn purge(&self, scope: &PurgeScope) -> Result<String, CdnError> {
        let Some(access_key) = self.access_key.as_deref() else {
            return Err(CdnError::MissingCredentials("bunny needs access_key"));
        };

        match scope {
            PurgeScope::All => {
                let Some(zone) = self.pull_zone_id.as_deref() else {
                    return Err(CdnError::MissingCredentials(
                        "bunny needs pull_zone_id to purge everything",
                    ));
                };
                let endpoint = self.endpoint(&format!("pullzone/{zone}/purgeCache"))?;
                self.post(endpoint, access_key).await?;
                Ok("purged pull zone".to_string())
            }
            PurgeScope::Urls(urls) => {
                for target in urls {
                    let mut endpoint = self.endpoint("purge")?;
                    endpoint.query_pairs_mut().append_pair("url", target);
                    self.post(endpoint, access_key).await?;
                }
                Ok(format!("purged {} url(s)", urls.len()))
            }
        }
    }
}

//! Source retrieval for the merge engine.
//!
//! Same-origin sources are read from the document root. Foreign sources are fetched over HTTP with
//! a bounded client, and successful bodies are memoised for a short TTL.

use std::{
    num::NonZeroUsize,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use lru::LruCache;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "assets::merge::fetch";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request for `{url}` failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("`{url}` answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("unusable asset source `{0}`")]
    InvalidSource(String),
}

/// A fetched source plus the URL relative references inside it resolve against.
#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub content: Arc<str>,
    pub base: Url,
    /// File backing the source when it was read from the document root.
    pub local_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Local { path: PathBuf, url: Url },
    Remote(Url),
}

struct RemoteEntry {
    fetched_at: Instant,
    body: Arc<str>,
}

pub struct SourceFetcher {
    site_url: Url,
    document_root: PathBuf,
    client: Client,
    ttl: Duration,
    remote: Mutex<LruCache<String, RemoteEntry>>,
}

impl SourceFetcher {
    pub fn new(
        site_url: Url,
        document_root: impl Into<PathBuf>,
        client: Client,
        ttl: Duration,
        capacity: NonZeroUsize,
    ) -> Self {
        Self {
            site_url,
            document_root: document_root.into(),
            client,
            ttl,
            remote: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn fetch(&self, src: &str) -> Result<FetchedSource, FetchError> {
        match self.locate(src)? {
            Location::Local { path, url } => {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: path.clone(),
                        source,
                    })?;
                Ok(FetchedSource {
                    content: content.into(),
                    base: url,
                    local_path: Some(path),
                })
            }
            Location::Remote(url) => {
                let content = self.fetch_remote(&url).await?;
                Ok(FetchedSource {
                    content,
                    base: url,
                    local_path: None,
                })
            }
        }
    }

    fn locate(&self, src: &str) -> Result<Location, FetchError> {
        let trimmed = src.trim();
        if trimmed.is_empty() || trimmed.starts_with("data:") {
            return Err(FetchError::InvalidSource(src.to_string()));
        }

        let absolute = if let Some(rest) = trimmed.strip_prefix("//") {
            Url::parse(&format!("https://{rest}"))
        } else {
            self.site_url.join(trimmed)
        }
        .map_err(|_| FetchError::InvalidSource(src.to_string()))?;

        if !matches!(absolute.scheme(), "http" | "https") {
            return Err(FetchError::InvalidSource(src.to_string()));
        }
        if absolute.host_str() != self.site_url.host_str()
            || absolute.port_or_known_default() != self.site_url.port_or_known_default()
        {
            return Ok(Location::Remote(absolute));
        }

        let relative = Path::new(absolute.path().trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(FetchError::InvalidSource(src.to_string()));
        }
        Ok(Location::Local {
            path: self.document_root.join(relative),
            url: absolute,
        })
    }

    async fn fetch_remote(&self, url: &Url) -> Result<Arc<str>, FetchError> {
        let key = url.to_string();
        {
            let mut cache = mutex_lock(&self.remote, SOURCE, "lookup");
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    debug!(url = %key, "Remote asset served from memo");
                    return Ok(Arc::clone(&entry.body));
                }
                cache.pop(&key);
            }
        }

        let http_error = |source| FetchError::Http {
            url: key.clone(),
            source,
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: key,
                status: status.as_u16(),
            });
        }
        let body: Arc<str> = response.text().await.map_err(http_error)?.into();

        mutex_lock(&self.remote, SOURCE, "store").put(
            key,
            RemoteEntry {
                fetched_at: Instant::now(),
                body: Arc::clone(&body),
            },
        );
        Ok(body)
    }
}

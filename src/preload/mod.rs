//! Preload recommendations learned from crawling the site's own pages.

mod analyze;
mod crawl;
mod engine;
mod state;
mod types;

use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::infra::error::InfraError;

pub use analyze::{HeadResource, extract_font_urls, scan_head};
pub use crawl::{HttpFetcher, ResourceFetcher};
pub use engine::{
    ContentSource, PassReport, PreloadLimits, PreloadRecommendationEngine, SCRIPT_SIZE_LIMIT,
    STYLE_SIZE_LIMIT, merge_observation, prune,
};
pub use state::{JsonDocument, PreloadConfig, PreloadState, RejectedAt};
pub use types::{Observation, PreloadEntry, Recommendation, ResourceType, recommendation_id};

#[derive(Debug, Error)]
pub enum PreloadError {
    #[error("request for `{url}` failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("`{url}` answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("preload state io at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("preload document `{path}` is malformed: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode preload document: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unknown recommendation `{0}`")]
    UnknownRecommendation(String),
    #[error(transparent)]
    Infra(#[from] InfraError),
}

impl PreloadError {
    pub(crate) fn fetch(url: &Url, source: reqwest::Error) -> Self {
        Self::Fetch {
            url: url.to_string(),
            source,
        }
    }
}

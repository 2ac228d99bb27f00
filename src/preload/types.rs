use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Style,
    Script,
    Font,
}

impl ResourceType {
    /// Value of the `as` attribute on a preload link.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Style => "style",
            Self::Script => "script",
            Self::Font => "font",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the live preload configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadEntry {
    pub url: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
}

impl PreloadEntry {
    pub fn new(url: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            url: url.into(),
            resource_type,
        }
    }
}

/// A render-blocking resource seen in the head of one crawled page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub url: Url,
    pub resource_type: ResourceType,
    /// Zero-based index among the head's direct children.
    pub position: u32,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Earliest head position the resource was observed at.
    pub position: u32,
    pub size: Option<u64>,
    /// Pages the resource was observed on.
    pub pages: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl Recommendation {
    pub fn to_entry(&self) -> PreloadEntry {
        PreloadEntry::new(self.url.clone(), self.resource_type)
    }

    /// Sort key: earlier in the head first, then smaller.
    pub(crate) fn rank(&self) -> (u32, u64, &str) {
        (self.position, self.size.unwrap_or(u64::MAX), &self.id)
    }
}

/// Identity of a recommendation: hash of its type and absolute URL without fragment.
pub fn recommendation_id(resource_type: ResourceType, url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(resource_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_str().as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(16);
    id
}

//! JSON site manifest: the content collaborator for entity purges and preload candidates.

use std::{fs, path::Path};

use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use crate::{cache::EntityResolver, preload::ContentSource};

use super::error::InfraError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntity {
    pub id: u64,
    pub permalink: String,
    /// Category, tag and other taxonomy archive URLs listing the entity.
    #[serde(default)]
    pub archives: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub published: Option<OffsetDateTime>,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    home: Option<String>,
    #[serde(default)]
    entities: Vec<ManifestEntity>,
    #[serde(default)]
    top_pages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SiteManifest {
    home: Url,
    entities: Vec<ManifestEntity>,
    top_pages: Vec<String>,
}

impl SiteManifest {
    /// Manifest with no entities; the home page is the only known page.
    pub fn empty(site_url: Url) -> Self {
        Self {
            home: site_url,
            entities: Vec::new(),
            top_pages: Vec::new(),
        }
    }

    pub fn load(path: &Path, site_url: &Url) -> Result<Self, InfraError> {
        let raw = fs::read(path)?;
        Self::parse(&raw, site_url).map_err(|message| {
            InfraError::configuration(format!("site manifest `{}`: {message}", path.display()))
        })
    }

    fn parse(raw: &[u8], site_url: &Url) -> Result<Self, String> {
        let manifest: RawManifest = serde_json::from_slice(raw).map_err(|err| err.to_string())?;
        let home = match manifest.home {
            Some(home) => site_url
                .join(&home)
                .map_err(|err| format!("invalid home `{home}`: {err}"))?,
            None => site_url.clone(),
        };
        Ok(Self {
            home,
            entities: manifest.entities,
            top_pages: manifest.top_pages,
        })
    }

    pub fn entity(&self, id: u64) -> Option<&ManifestEntity> {
        self.entities.iter().find(|entity| entity.id == id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn absolute(&self, url: &str) -> Option<Url> {
        self.home.join(url).ok()
    }
}

impl EntityResolver for SiteManifest {
    fn related_urls(&self, entity_id: u64) -> Vec<String> {
        let Some(entity) = self.entity(entity_id) else {
            return Vec::new();
        };

        let mut urls = vec![entity.permalink.clone()];
        urls.extend(entity.archives.iter().cloned());
        urls.extend(entity.author.iter().cloned());
        if let Some(published) = entity.published {
            let (year, month, day) = (
                published.year(),
                u8::from(published.month()),
                published.day(),
            );
            urls.push(format!("/{year}/"));
            urls.push(format!("/{year}/{month:02}/"));
            urls.push(format!("/{year}/{month:02}/{day:02}/"));
        }
        if entity.pinned {
            urls.push(self.home.path().to_string());
        }
        urls
    }
}

impl ContentSource for SiteManifest {
    fn home_url(&self) -> Url {
        self.home.clone()
    }

    fn recent_entries(&self, limit: usize) -> Vec<Url> {
        let mut published: Vec<&ManifestEntity> = self
            .entities
            .iter()
            .filter(|entity| entity.published.is_some())
            .collect();
        published.sort_by(|a, b| b.published.cmp(&a.published));
        published
            .into_iter()
            .take(limit)
            .filter_map(|entity| self.absolute(&entity.permalink))
            .collect()
    }

    fn top_pages(&self) -> Vec<Url> {
        self.top_pages
            .iter()
            .filter_map(|page| self.absolute(page))
            .collect()
    }
}

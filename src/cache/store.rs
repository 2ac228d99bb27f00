//! On-disk page entries: `{key}.html` holds the payload, `{key}.meta` the JSON metadata.
//!
//! The payload is written before the metadata, and readers treat a key without metadata as
//! absent, so a crash between the two writes leaves at most an orphaned payload.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use crate::infra::fs::{remove_if_exists, write_atomic};

use super::keys::PageKey;

const HTML_EXT: &str = "html";
const META_EXT: &str = "meta";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page cache i/o failed at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("page cache metadata could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub url: String,
    pub size: u64,
    #[serde(with = "time::serde::timestamp")]
    pub created: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CachedPage {
    pub key: PageKey,
    pub body: Bytes,
    pub meta: EntryMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub files: usize,
    pub total_bytes: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub newest: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &PageKey, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{ext}", key.as_str()))
    }

    pub fn write(&self, key: &PageKey, html: &str, meta: &EntryMeta) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(meta)?;

        let html_path = self.path_for(key, HTML_EXT);
        write_atomic(&html_path, html.as_bytes()).map_err(|err| StoreError::io(&html_path, err))?;

        let meta_path = self.path_for(key, META_EXT);
        write_atomic(&meta_path, &encoded).map_err(|err| StoreError::io(&meta_path, err))
    }

    /// Metadata for `key`, or `None` when the entry is absent or its metadata is unreadable.
    pub fn read_meta(&self, key: &PageKey) -> Result<Option<EntryMeta>, StoreError> {
        let meta_path = self.path_for(key, META_EXT);
        let raw = match fs::read(&meta_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&meta_path, err)),
        };

        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(err) => {
                warn!(
                    path = %meta_path.display(),
                    error = %err,
                    "Ignoring malformed page cache metadata"
                );
                Ok(None)
            }
        }
    }

    pub fn read(&self, key: &PageKey) -> Result<Option<CachedPage>, StoreError> {
        let Some(meta) = self.read_meta(key)? else {
            return Ok(None);
        };

        let html_path = self.path_for(key, HTML_EXT);
        match fs::read(&html_path) {
            Ok(body) => Ok(Some(CachedPage {
                key: key.clone(),
                body: Bytes::from(body),
                meta,
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(&html_path, err)),
        }
    }

    /// Remove both files of an entry. Returns whether a payload existed.
    pub fn remove(&self, key: &PageKey) -> Result<bool, StoreError> {
        let html_path = self.path_for(key, HTML_EXT);
        let removed = remove_if_exists(&html_path).map_err(|err| StoreError::io(&html_path, err))?;

        let meta_path = self.path_for(key, META_EXT);
        remove_if_exists(&meta_path).map_err(|err| StoreError::io(&meta_path, err))?;

        Ok(removed)
    }

    /// Every entry with readable metadata. A missing cache directory is an empty cache.
    pub fn entries(&self) -> Result<Vec<(PageKey, EntryMeta)>, StoreError> {
        let mut entries = Vec::new();
        for key in self.keys_with_ext(META_EXT)? {
            if let Some(meta) = self.read_meta(&key)? {
                entries.push((key, meta));
            }
        }
        Ok(entries)
    }

    /// Remove every entry, including orphaned payloads. Returns the number of payloads removed.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in self.keys_with_ext(HTML_EXT)? {
            if self.remove(&key)? {
                removed += 1;
            }
        }
        for key in self.keys_with_ext(META_EXT)? {
            self.remove(&key)?;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for (_, meta) in self.entries()? {
            stats.files += 1;
            stats.total_bytes += meta.size;
            stats.oldest = Some(match stats.oldest {
                Some(oldest) => oldest.min(meta.created),
                None => meta.created,
            });
            stats.newest = Some(match stats.newest {
                Some(newest) => newest.max(meta.created),
                None => meta.created,
            });
        }
        Ok(stats)
    }

    fn keys_with_ext(&self, ext: &str) -> Result<Vec<PageKey>, StoreError> {
        let reader = match fs::read_dir(&self.root) {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&self.root, err)),
        };

        let mut keys = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|err| StoreError::io(&self.root, err))?;
            let path = entry.path();
            if path.extension().and_then(|value| value.to_str()) != Some(ext) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(PageKey::parse)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

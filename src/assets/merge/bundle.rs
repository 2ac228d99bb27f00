//! Content-addressed bundle artifacts.
//!
//! `{type}-{group}-{key}.{css|js}` holds the merged payload and `{type}-{group}-{key}.meta` its
//! JSON metadata. Artifacts are immutable once written; a changed input set yields a new key and
//! a new file, and old files stay until [`BundleStore::purge_all`].

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::cache::StoreStats;
use crate::infra::fs::{remove_if_exists, write_atomic};

use super::super::types::{AssetGroup, AssetKind};
use super::MergeError;

const META_EXT: &str = "meta";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub group: AssetGroup,
    pub key: String,
    pub handles: Vec<String>,
    /// Sources as declared, in bundle order.
    pub sources: Vec<String>,
    /// Local files consulted by the staleness policy.
    #[serde(default)]
    pub local_files: Vec<PathBuf>,
    pub size: u64,
    #[serde(with = "time::serde::timestamp")]
    pub created: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub path: PathBuf,
    pub url: String,
    pub meta: BundleMeta,
}

#[derive(Debug, Clone)]
pub struct BundleStore {
    dir: PathBuf,
    url_base: String,
}

impl BundleStore {
    pub fn new(dir: impl Into<PathBuf>, url_base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            url_base: url_base.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(kind: AssetKind, group: AssetGroup, key: &str) -> String {
        format!("{kind}-{group}-{key}")
    }

    pub fn payload_path(&self, kind: AssetKind, group: AssetGroup, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Self::stem(kind, group, key), kind.extension()))
    }

    fn meta_path(&self, kind: AssetKind, group: AssetGroup, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{META_EXT}", Self::stem(kind, group, key)))
    }

    pub fn url_for(&self, kind: AssetKind, group: AssetGroup, key: &str) -> String {
        format!(
            "{}/{}.{}",
            self.url_base.trim_end_matches('/'),
            Self::stem(kind, group, key),
            kind.extension()
        )
    }

    /// Existing bundle for the key, or `None` when payload or metadata is missing or unreadable.
    pub fn load(
        &self,
        kind: AssetKind,
        group: AssetGroup,
        key: &str,
    ) -> Result<Option<Bundle>, MergeError> {
        let path = self.payload_path(kind, group, key);
        if !path.exists() {
            return Ok(None);
        }

        let meta_path = self.meta_path(kind, group, key);
        let raw = match fs::read(&meta_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MergeError::io(&meta_path, err)),
        };
        match serde_json::from_slice::<BundleMeta>(&raw) {
            Ok(meta) => Ok(Some(Bundle {
                url: self.url_for(kind, group, key),
                path,
                meta,
            })),
            Err(err) => {
                warn!(
                    path = %meta_path.display(),
                    error = %err,
                    "Ignoring malformed bundle metadata"
                );
                Ok(None)
            }
        }
    }

    pub fn write(&self, content: &str, meta: BundleMeta) -> Result<Bundle, MergeError> {
        let encoded = serde_json::to_vec(&meta)?;

        let path = self.payload_path(meta.kind, meta.group, &meta.key);
        write_atomic(&path, content.as_bytes()).map_err(|err| MergeError::io(&path, err))?;

        let meta_path = self.meta_path(meta.kind, meta.group, &meta.key);
        write_atomic(&meta_path, &encoded).map_err(|err| MergeError::io(&meta_path, err))?;

        Ok(Bundle {
            url: self.url_for(meta.kind, meta.group, &meta.key),
            path,
            meta,
        })
    }

    /// Delete every bundle artifact. Returns the number of payload files removed.
    pub fn purge_all(&self) -> Result<usize, MergeError> {
        let mut removed = 0;
        for path in self.artifact_paths()? {
            let is_payload = path.extension().and_then(|ext| ext.to_str()) != Some(META_EXT);
            if remove_if_exists(&path).map_err(|err| MergeError::io(&path, err))? && is_payload {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<StoreStats, MergeError> {
        let mut stats = StoreStats::default();
        for path in self.artifact_paths()? {
            if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXT) {
                continue;
            }
            let Some(meta) = fs::read(&path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<BundleMeta>(&raw).ok())
            else {
                continue;
            };
            stats.files += 1;
            stats.total_bytes += meta.size;
            stats.oldest = Some(stats.oldest.map_or(meta.created, |t| t.min(meta.created)));
            stats.newest = Some(stats.newest.map_or(meta.created, |t| t.max(meta.created)));
        }
        Ok(stats)
    }

    fn artifact_paths(&self) -> Result<Vec<PathBuf>, MergeError> {
        let reader = match fs::read_dir(&self.dir) {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(MergeError::io(&self.dir, err)),
        };

        let mut paths = Vec::new();
        for entry in reader {
            let path = entry.map_err(|err| MergeError::io(&self.dir, err))?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let ours = name.starts_with("style-") || name.starts_with("script-");
            let known_ext = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("css" | "js" | META_EXT)
            );
            if ours && known_ext {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

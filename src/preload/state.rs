//! Persistent preload documents.
//!
//! Recommendations and rejection memory share one JSON document; the live preload configuration
//! lives in another so operators can edit it by hand.

use std::{
    collections::BTreeMap,
    fs, io,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;

use crate::infra::fs::write_atomic;

use super::{
    PreloadError,
    types::{PreloadEntry, Recommendation},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadState {
    #[serde(default)]
    pub recommendations: BTreeMap<String, Recommendation>,
    /// Ids an operator dismissed, with the moment of dismissal.
    #[serde(default)]
    pub rejected: BTreeMap<String, RejectedAt>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedAt(#[serde(with = "time::serde::rfc3339")] pub OffsetDateTime);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadConfig {
    #[serde(default)]
    pub entries: Vec<PreloadEntry>,
}

impl PreloadConfig {
    pub fn contains(&self, entry: &PreloadEntry) -> bool {
        self.entries.contains(entry)
    }
}

/// A JSON document on disk. A missing file reads as the default value.
#[derive(Debug, Clone)]
pub struct JsonDocument<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<T, PreloadError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => {
                return Err(PreloadError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&raw).map_err(|source| PreloadError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, value: &T) -> Result<(), PreloadError> {
        let encoded = serde_json::to_vec_pretty(value).map_err(PreloadError::Encode)?;
        write_atomic(&self.path, &encoded).map_err(|source| PreloadError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

//! Bundle staleness policies.

use std::path::{Path, PathBuf};

use crate::infra::fs::modified_at;

/// Decides whether an existing bundle must be rebuilt.
pub trait StalenessPolicy: Send + Sync {
    fn is_stale(&self, bundle: &Path, local_sources: &[PathBuf]) -> bool;
}

/// A bundle is stale when it is missing or any local source was modified after it was written.
/// Remote sources never mark a bundle stale; their declared versions are part of the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct MtimeStaleness;

impl StalenessPolicy for MtimeStaleness {
    fn is_stale(&self, bundle: &Path, local_sources: &[PathBuf]) -> bool {
        let Some(built_at) = modified_at(bundle) else {
            return true;
        };
        local_sources
            .iter()
            .filter_map(|source| modified_at(source))
            .any(|modified| modified > built_at)
    }
}

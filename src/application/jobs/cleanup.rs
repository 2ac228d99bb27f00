//! Cron job sweeping expired page cache entries.

use std::sync::Arc;

use apalis::prelude::*;

use crate::cache::CacheStore;

#[derive(Default, Debug, Clone)]
pub struct CleanupJob;

impl From<chrono::DateTime<chrono::Utc>> for CleanupJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct CleanupJobContext {
    pub cache: Arc<CacheStore>,
}

/// Sweep entries older than the base TTL. The sweep itself logs what it removed.
pub async fn process_cleanup_job(
    _job: CleanupJob,
    ctx: Data<CleanupJobContext>,
) -> Result<(), apalis::prelude::Error> {
    ctx.cache.cleanup_expired();
    Ok(())
}

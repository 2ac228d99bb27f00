//! Cron job for the daily preload recommendation pass.

use std::sync::Arc;

use apalis::prelude::*;

use crate::preload::PreloadRecommendationEngine;

/// Marker for the cron-triggered preload pass.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct PreloadPassJob;

impl From<chrono::DateTime<chrono::Utc>> for PreloadPassJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct PreloadJobContext {
    pub engine: Arc<PreloadRecommendationEngine>,
}

/// A failed pass is logged and retried on the next tick.
pub async fn process_preload_pass_job(
    _job: PreloadPassJob,
    ctx: Data<PreloadJobContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx.engine.run().await {
        Ok(report) => {
            tracing::info!(
                candidates = report.candidates,
                failed = report.failed,
                recommendations = report.recommendations,
                "Scheduled preload pass finished"
            );
        }
        Err(err) => {
            tracing::warn!(error = %err, "Scheduled preload pass failed");
        }
    }
    Ok(())
}

//! Background schedule: daily preload pass and hourly expired-entry sweep.

mod cleanup;
mod preload;

use std::{str::FromStr, sync::Arc};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_cron::{CronStream, Schedule};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    application::error::AppError, cache::CacheStore, config::SchedulerSettings,
    preload::PreloadRecommendationEngine,
};

pub use cleanup::{CleanupJob, CleanupJobContext, process_cleanup_job};
pub use preload::{PreloadJobContext, PreloadPassJob, process_preload_pass_job};

pub fn parse_schedule(key: &'static str, expression: &str) -> Result<Schedule, AppError> {
    Schedule::from_str(expression).map_err(|err| {
        AppError::validation(format!("{key}: invalid cron expression `{expression}`: {err}"))
    })
}

pub fn spawn_scheduler(
    settings: &SchedulerSettings,
    cache: Arc<CacheStore>,
    engine: Arc<PreloadRecommendationEngine>,
) -> Result<JoinHandle<()>, AppError> {
    let preload_schedule =
        parse_schedule("scheduler.preload_schedule", &settings.preload_schedule)?;
    let cleanup_schedule =
        parse_schedule("scheduler.cleanup_schedule", &settings.cleanup_schedule)?;

    let preload_worker = WorkerBuilder::new("preload-pass-worker")
        .data(PreloadJobContext { engine })
        .backend(CronStream::new(preload_schedule))
        .build_fn(process_preload_pass_job);
    let cleanup_worker = WorkerBuilder::new("cache-cleanup-worker")
        .data(CleanupJobContext { cache })
        .backend(CronStream::new(cleanup_schedule))
        .build_fn(process_cleanup_job);

    let monitor = Monitor::new()
        .register(preload_worker)
        .register(cleanup_worker);

    info!(
        preload = %settings.preload_schedule,
        cleanup = %settings.cleanup_schedule,
        "Scheduler started"
    );
    Ok(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    }))
}

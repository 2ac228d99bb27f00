use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "spry_page_cache_hit_total",
            Unit::Count,
            "Total number of page cache hits served from disk."
        );
        describe_counter!(
            "spry_page_cache_miss_total",
            Unit::Count,
            "Total number of cacheable requests that had to render."
        );
        describe_counter!(
            "spry_page_cache_store_failed_total",
            Unit::Count,
            "Total number of rendered pages that could not be written to disk."
        );
        describe_counter!(
            "spry_page_cache_purged_total",
            Unit::Count,
            "Total number of page cache entries removed by purges and sweeps."
        );
        describe_gauge!(
            "spry_purge_event_queue_len",
            Unit::Count,
            "Current number of pending purge events in the queue."
        );
        describe_histogram!(
            "spry_purge_consume_ms",
            Unit::Milliseconds,
            "Purge event consumption latency in milliseconds."
        );
        describe_counter!(
            "spry_bundle_built_total",
            Unit::Count,
            "Total number of merged bundles written to disk."
        );
        describe_counter!(
            "spry_bundle_reused_total",
            Unit::Count,
            "Total number of merge requests served by an existing fresh bundle."
        );
        describe_counter!(
            "spry_merge_fallback_total",
            Unit::Count,
            "Total number of groups delivered unmerged after a merge failure."
        );
        describe_histogram!(
            "spry_preload_pass_ms",
            Unit::Milliseconds,
            "Preload recommendation pass latency in milliseconds."
        );
        describe_counter!(
            "spry_cdn_purge_failure_total",
            Unit::Count,
            "Total number of CDN provider purge calls that failed."
        );
    });
}

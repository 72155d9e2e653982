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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "eventmirror_cache_hit_total",
            Unit::Count,
            "Total number of fresh cache hits."
        );
        describe_counter!(
            "eventmirror_cache_miss_total",
            Unit::Count,
            "Total number of cache misses, including stale rows."
        );
        describe_counter!(
            "eventmirror_cache_read_error_total",
            Unit::Count,
            "Cache reads that failed and were treated as misses."
        );
        describe_counter!(
            "eventmirror_cache_write_total",
            Unit::Count,
            "Upstream responses written to the cache."
        );
        describe_counter!(
            "eventmirror_cache_write_skipped_total",
            Unit::Count,
            "Empty upstream responses that were not cached."
        );
        describe_counter!(
            "eventmirror_cache_write_error_total",
            Unit::Count,
            "Cache writes that failed and were dropped."
        );
        describe_counter!(
            "eventmirror_upstream_response_total",
            Unit::Count,
            "Upstream attempts by response class."
        );
        describe_counter!(
            "eventmirror_upstream_retry_total",
            Unit::Count,
            "Rate-limited attempts scheduled for retry."
        );
        describe_counter!(
            "eventmirror_upstream_retry_exhausted_total",
            Unit::Count,
            "Fetches abandoned after the backoff budget ran out."
        );
        describe_counter!(
            "eventmirror_fetch_timeout_total",
            Unit::Count,
            "Fetches that exceeded the job timeout."
        );
        describe_gauge!(
            "eventmirror_fetch_active",
            Unit::Count,
            "Upstream calls currently in flight."
        );
        describe_gauge!(
            "eventmirror_fetch_waiting",
            Unit::Count,
            "Fetches waiting for an admission slot."
        );
        describe_gauge!(
            "eventmirror_fetch_delayed",
            Unit::Count,
            "Fetches sleeping through a rate-limit backoff."
        );
        describe_histogram!(
            "eventmirror_hydration_entity_ms",
            Unit::Milliseconds,
            "Time to hydrate a single registrant."
        );
    });
}

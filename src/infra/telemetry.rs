use std::sync::Once;

use metrics::{Unit, describe_counter};
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

/// Register descriptions for every cache metric. Safe to call repeatedly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "prerender_cache_client_disconnect_total",
            Unit::Count,
            "Total number of cached responses abandoned by the client."
        );
        describe_counter!(
            "prerender_cache_hit_total",
            Unit::Count,
            "Total number of fresh cache entries served."
        );
        describe_counter!(
            "prerender_cache_stale_hit_total",
            Unit::Count,
            "Total number of expired cache entries served while a rebuild runs."
        );
        describe_counter!(
            "prerender_cache_miss_total",
            Unit::Count,
            "Total number of lookups that fell through to the renderer."
        );
        describe_counter!(
            "prerender_cache_storage_error_total",
            Unit::Count,
            "Total number of storage failures while serving, by error kind."
        );
        describe_counter!(
            "prerender_cache_save_total",
            Unit::Count,
            "Total number of rendered pages written to storage."
        );
        describe_counter!(
            "prerender_cache_save_skipped_total",
            Unit::Count,
            "Total number of renders not cached due to status or size."
        );
        describe_counter!(
            "prerender_cache_save_failed_total",
            Unit::Count,
            "Total number of failed cache writes, by error kind."
        );
    });
}

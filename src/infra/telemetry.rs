//! Tracing subscriber and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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
            "h1b_insights_report_cache_hit_total",
            Unit::Count,
            "Total number of report reads served from the cache."
        );
        describe_counter!(
            "h1b_insights_report_cache_miss_total",
            Unit::Count,
            "Total number of report reads that found no fresh entry."
        );
        describe_counter!(
            "h1b_insights_report_coalesced_total",
            Unit::Count,
            "Total number of report reads that joined a running computation."
        );
        describe_counter!(
            "h1b_insights_report_failure_total",
            Unit::Count,
            "Total number of failed report computations."
        );
        describe_histogram!(
            "h1b_insights_report_query_ms",
            Unit::Milliseconds,
            "Report computation latency in milliseconds."
        );
        describe_histogram!(
            "h1b_insights_report_warm_ms",
            Unit::Milliseconds,
            "Full cache warm latency in milliseconds."
        );
    });
}

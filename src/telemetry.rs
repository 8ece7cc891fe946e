//! Logging and metrics installation.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use serde::Deserialize;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::error::EngineError;

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "scorta_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "scorta_cache_miss_total";
pub(crate) const METRIC_NETWORK_FETCH_TOTAL: &str = "scorta_network_fetch_total";
pub(crate) const METRIC_CACHE_WRITE_FAILURE_TOTAL: &str = "scorta_cache_write_failure_total";
pub(crate) const METRIC_GENERATION_SWAP_TOTAL: &str = "scorta_generation_swap_total";
pub(crate) const METRIC_POPULATION_MS: &str = "scorta_population_ms";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

/// Install a global tracing subscriber and describe the engine metrics.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`.
pub fn init(format: LogFormat) -> Result<(), EngineError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = match format {
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
            EngineError::configuration(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Total number of requests served from a cache set."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Total number of cache lookups that missed."
        );
        describe_counter!(
            METRIC_NETWORK_FETCH_TOTAL,
            Unit::Count,
            "Total number of network fetches issued by the strategy engine."
        );
        describe_counter!(
            METRIC_CACHE_WRITE_FAILURE_TOTAL,
            Unit::Count,
            "Total number of swallowed cache write failures."
        );
        describe_counter!(
            METRIC_GENERATION_SWAP_TOTAL,
            Unit::Count,
            "Total number of completed generation swaps."
        );
        describe_histogram!(
            METRIC_POPULATION_MS,
            Unit::Milliseconds,
            "Duration of bulk cache population."
        );
    });
}

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::{processor, render, scheduler},
    cache,
    config::{LogFormat, LoggingSettings},
    infra::pool,
};

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

pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            cache::METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of cache reads that found an entry."
        );
        describe_counter!(
            cache::METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of cache reads for keys never rendered."
        );
        describe_counter!(
            cache::METRIC_CACHE_STALE,
            Unit::Count,
            "Total number of reads that found an expired or errored entry."
        );
        describe_counter!(
            scheduler::METRIC_SCHEDULER_COLLAPSED,
            Unit::Count,
            "Total number of render requests attached to an already active task."
        );
        describe_counter!(
            scheduler::METRIC_SCHEDULER_REJECTED,
            Unit::Count,
            "Total number of render requests rejected while the circuit was open."
        );
        describe_gauge!(
            scheduler::METRIC_SCHEDULER_ACTIVE,
            Unit::Count,
            "Current number of keys with a queued or running render."
        );
        describe_gauge!(
            pool::METRIC_POOL_BACKLOG,
            Unit::Count,
            "Current number of jobs waiting for a free worker."
        );
        describe_histogram!(
            pool::METRIC_POOL_JOB_MS,
            Unit::Milliseconds,
            "Pool job latency from submission to result in milliseconds."
        );
        describe_counter!(
            pool::METRIC_POOL_WORKER_LOST,
            Unit::Count,
            "Total number of workers lost to panics, timeouts, or termination."
        );
        describe_counter!(
            pool::METRIC_POOL_WORKER_RESTART,
            Unit::Count,
            "Total number of replacement workers started."
        );
        describe_histogram!(
            render::METRIC_RENDER_MS,
            Unit::Milliseconds,
            "Render backend latency in milliseconds."
        );
        describe_counter!(
            processor::METRIC_BACKEND_RECOVERY,
            Unit::Count,
            "Total number of backend recovery runs by outcome."
        );
    });
}

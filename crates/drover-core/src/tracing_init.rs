//! Shared tracing/logging initialization.
//!
//! The daemon, the CLI and the worker runtime all use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON
//! output. Workers must log to stderr: their stdout carries the NDJSON
//! event stream.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Where formatted log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    #[default]
    Stdout,
    Stderr,
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"drover_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool, target: LogTarget) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    match (log_json, target) {
        (true, LogTarget::Stdout) => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        (true, LogTarget::Stderr) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        (false, LogTarget::Stdout) => registry.with(tracing_subscriber::fmt::layer()).init(),
        (false, LogTarget::Stderr) => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Initialise tracing and, when an endpoint is given and the `metrics`
/// feature is enabled, the OTLP pipeline.
///
/// The returned guard must be held for the lifetime of the process.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> Option<crate::metrics::MetricsGuard> {
    let Some(endpoint) = endpoint else {
        init_tracing(default_filter, log_json, LogTarget::Stdout);
        return None;
    };

    let guard = match crate::metrics::init_metrics(endpoint) {
        Ok(guard) => guard,
        Err(e) => {
            init_tracing(default_filter, log_json, LogTarget::Stdout);
            tracing::warn!(error = %e, endpoint, "OTLP pipeline unavailable, metrics disabled");
            return None;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let otel = tracing_opentelemetry::layer().with_tracer(guard.tracer());
    let registry = tracing_subscriber::registry().with(env_filter).with(otel);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Some(guard)
}

/// Without the `metrics` feature the endpoint is ignored.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> Option<()> {
    init_tracing(default_filter, log_json, LogTarget::Stdout);
    if endpoint.is_some() {
        tracing::warn!("metrics endpoint given but the `metrics` feature is disabled");
    }
    None
}

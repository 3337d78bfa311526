//! Shared `OpenTelemetry` metrics initialisation.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP exporter for both traces and metrics, sending
//! telemetry to a configurable endpoint (e.g. an `OpenTelemetry` Collector),
//! and exposes the pool counters the supervisor increments.

use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Opaque handle that keeps the `OpenTelemetry` providers alive.
///
/// When dropped, the providers are **not** shut down automatically -- call
/// [`MetricsGuard::shutdown`] for a graceful flush before exiting.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Tracer feeding the `tracing-opentelemetry` layer.
    pub fn tracer(&self) -> SdkTracer {
        self.tracer_provider.tracer("drover")
    }

    /// Gracefully shut down both providers, flushing any buffered telemetry.
    ///
    /// # Errors
    ///
    /// Returns an error if either provider fails to shut down cleanly.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the `OpenTelemetry` OTLP pipeline for traces **and** metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
///
/// # Errors
///
/// Returns [`MetricsError`] if the OTLP exporters cannot be constructed.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    // --- Traces ---
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    // --- Metrics ---
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Counters incremented by the supervisor.
pub struct PoolCounters {
    restarts: Counter<u64>,
    crash_loops: Counter<u64>,
    forced_kills: Counter<u64>,
    rejections: Counter<u64>,
}

impl PoolCounters {
    fn new() -> Self {
        let meter = global::meter("drover");
        Self {
            restarts: meter
                .u64_counter("drover.worker.restarts")
                .with_description("Worker respawns after a crash or timeout")
                .build(),
            crash_loops: meter
                .u64_counter("drover.worker.crash_loops")
                .with_description("Slots halted by the crash-loop breaker")
                .build(),
            forced_kills: meter
                .u64_counter("drover.worker.forced_kills")
                .with_description("Workers killed after the graceful shutdown timeout")
                .build(),
            rejections: meter
                .u64_counter("drover.dispatch.rejections")
                .with_description("Connections rejected with no capacity")
                .build(),
        }
    }

    pub fn restart(&self) {
        self.restarts.add(1, &[]);
    }

    pub fn crash_loop(&self) {
        self.crash_loops.add(1, &[]);
    }

    pub fn forced_kill(&self) {
        self.forced_kills.add(1, &[]);
    }

    pub fn rejection(&self) {
        self.rejections.add(1, &[]);
    }
}

/// Process-wide pool counters, created on first use against the global
/// meter provider.
pub fn counters() -> &'static PoolCounters {
    static COUNTERS: OnceLock<PoolCounters> = OnceLock::new();
    COUNTERS.get_or_init(PoolCounters::new)
}

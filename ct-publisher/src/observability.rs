// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Metrics, logging, and span export.
//!
//! [`stats_and_logging`] is called once during startup, after the configuration is loaded. It
//! installs the global `tracing` subscriber and returns the metrics scope shared by the RPC
//! server and the services it hosts, along with a [`TelemetryGuard`] that must be kept alive
//! until the process exits.

use anyhow::Context;
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, TracerProvider},
    Resource,
};
use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing_subscriber::{
    filter::LevelFilter, fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter, Layer,
};

use crate::{
    config::{Config, OpenTelemetryConfig},
    profiling,
};

/// The environment variable that overrides `syslog.stdout_level` with an [`EnvFilter`] directive.
pub const LOG_FILTER_ENV: &str = "CT_PUBLISHER_LOG";

const SERVICE_NAME: &str = "ct-publisher";

/// Buckets for RPC and submission latency, in seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// The metrics scope.
///
/// Clones share the underlying registry and collectors.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub(crate) rpc_requests: IntCounterVec,
    pub(crate) rpc_latency: HistogramVec,
    pub(crate) rpc_connections: IntCounter,
    pub(crate) rpc_open_connections: IntGauge,
    pub(crate) submissions: IntCounterVec,
    pub(crate) submission_latency: HistogramVec,
    block_profile_rate: IntGauge,
    block_events: IntGauge,
    block_samples: IntGauge,
    blocked_seconds: Gauge,
}

impl Metrics {
    /// Create the collectors and register them with a new registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let rpc_requests = IntCounterVec::new(
            Opts::new(
                "ct_publisher_rpc_requests_total",
                "RPC requests handled, by service, method, and outcome",
            ),
            &["service", "method", "status"],
        )?;
        registry.register(Box::new(rpc_requests.clone()))?;

        let rpc_latency = HistogramVec::new(
            HistogramOpts::new(
                "ct_publisher_rpc_request_duration_seconds",
                "Time spent handling RPC requests",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["service", "method"],
        )?;
        registry.register(Box::new(rpc_latency.clone()))?;

        let rpc_connections = IntCounter::new(
            "ct_publisher_rpc_connections_total",
            "RPC connections that completed the TLS handshake",
        )?;
        registry.register(Box::new(rpc_connections.clone()))?;

        let rpc_open_connections = IntGauge::new(
            "ct_publisher_rpc_open_connections",
            "RPC connections currently open",
        )?;
        registry.register(Box::new(rpc_open_connections.clone()))?;

        let submissions = IntCounterVec::new(
            Opts::new(
                "ct_publisher_submissions_total",
                "Submissions to CT logs, by log, certificate kind, and outcome",
            ),
            &["log", "kind", "status"],
        )?;
        registry.register(Box::new(submissions.clone()))?;

        let submission_latency = HistogramVec::new(
            HistogramOpts::new(
                "ct_publisher_submission_duration_seconds",
                "Time taken by CT logs to return an SCT",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["log", "kind"],
        )?;
        registry.register(Box::new(submission_latency.clone()))?;

        let block_profile_rate = IntGauge::new(
            "ct_publisher_block_profile_rate_nanoseconds",
            "The blocking event sampling rate; zero when sampling is off",
        )?;
        registry.register(Box::new(block_profile_rate.clone()))?;
        let block_events = IntGauge::new(
            "ct_publisher_block_events",
            "Blocking events observed in the async runtime",
        )?;
        registry.register(Box::new(block_events.clone()))?;
        let block_samples = IntGauge::new(
            "ct_publisher_block_samples",
            "Blocking events that were sampled",
        )?;
        registry.register(Box::new(block_samples.clone()))?;
        let blocked_seconds = Gauge::new(
            "ct_publisher_block_sampled_seconds",
            "Total blocked time of the sampled events",
        )?;
        registry.register(Box::new(blocked_seconds.clone()))?;

        Ok(Self {
            registry,
            rpc_requests,
            rpc_latency,
            rpc_connections,
            rpc_open_connections,
            submissions,
            submission_latency,
            block_profile_rate,
            block_events,
            block_samples,
            blocked_seconds,
        })
    }

    /// The underlying registry, for services that want to register their own collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let profile = profiling::block_profile().snapshot();
        self.block_profile_rate
            .set(i64::try_from(profile.rate).unwrap_or(i64::MAX));
        self.block_events
            .set(i64::try_from(profile.events).unwrap_or(i64::MAX));
        self.block_samples
            .set(i64::try_from(profile.samples).unwrap_or(i64::MAX));
        self.blocked_seconds.set(profile.sampled.as_secs_f64());

        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Map a syslog severity to the most verbose `tracing` level it includes.
///
/// Negative values disable the output.
pub fn severity_filter(level: i8) -> LevelFilter {
    match level {
        i8::MIN..=-1 => LevelFilter::OFF,
        0..=3 => LevelFilter::ERROR,
        4 => LevelFilter::WARN,
        5 | 6 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

/// Flushes and shuts down span export when dropped.
#[derive(Default)]
#[must_use = "span export stops when the guard is dropped"]
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("exporting", &self.provider.is_some())
            .finish()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(error) = provider.shutdown() {
                eprintln!("Failed to shut down span export: {error}");
            }
        }
    }
}

fn tracer_provider(config: &OpenTelemetryConfig) -> anyhow::Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()
        .with_context(|| format!("failed to build an OTLP exporter for {}", config.endpoint))?;
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        config.sample_ratio,
    )));

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(sampler)
        .with_resource(Resource::new([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build())
}

/// Set up metrics, install the global log subscriber, and start span export.
///
/// This must be called from within a Tokio runtime when `open_telemetry.endpoint` is set, since
/// spans are exported from a background task.
pub fn stats_and_logging(config: &Config) -> anyhow::Result<(Metrics, TelemetryGuard)> {
    let metrics = Metrics::new().context("failed to register metrics")?;

    let stderr_filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(directives) => EnvFilter::builder().parse(&directives).with_context(|| {
            format!(
                "{LOG_FILTER_ENV} contains an invalid log directive; refer to \
                https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
                filter/struct.EnvFilter.html#directives for format details."
            )
        })?,
        Err(_) => EnvFilter::default().add_directive(severity_filter(config.syslog.stdout_level).into()),
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let syslog_layer = (config.syslog.syslog_level >= 0).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_filter(severity_filter(config.syslog.syslog_level))
    });

    let mut guard = TelemetryGuard::default();
    let otel_layer = if config.open_telemetry.endpoint.is_empty() {
        None
    } else {
        let provider = tracer_provider(&config.open_telemetry)?;
        let tracer = provider.tracer(SERVICE_NAME);
        guard.provider = Some(provider);
        Some(
            tracing_opentelemetry::layer()
                .with_tracer(tracer)
                .with_filter(LevelFilter::INFO),
        )
    };

    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(syslog_layer)
        .with(otel_layer);
    tracing::subscriber::set_global_default(registry)
        .context("a global log subscriber was already installed")?;

    Ok((metrics, guard))
}

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};
use trigger_plugin::plugin::LogLevel;

/// Target of the one-line JSON report written per delivery or renewal.
pub const REPORT_TARGET: &str = "delivery";

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("changefeed").build())
        .clone()
}

/// OTLP providers kept alive for the life of the process.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    fn init(endpoint: &str) -> Result<Self> {
        let log_exporter = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("building OTLP log exporter")?;
        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(get_resource())
            .build();

        let metric_exporter = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("building OTLP metric exporter")?;
        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(metric_exporter)
            .with_resource(get_resource())
            .build();
        global::set_meter_provider(meter_provider.clone());

        Ok(Self { logger_provider, meter_provider })
    }

    /// Flushes pending exports; an invocation is short-lived, so this runs on every exit.
    pub fn shutdown(&self) {
        if let Err(e) = self.logger_provider.shutdown() {
            error!("otel log shutdown failed: {e}");
        }
        if let Err(e) = self.meter_provider.shutdown() {
            error!("otel meter shutdown failed: {e}");
        }
    }
}

fn split_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let dir = path.parent().ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    let name = path.file_name().ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok((dir.to_path_buf(), PathBuf::from(name)))
}

/// Installs the global subscriber: a daily rolling text log, a daily rolling JSON
/// report log (target `delivery`), and OTLP logs/metrics when an endpoint is given.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: LogLevel,
    otel_endpoint: Option<String>,
) -> Result<Option<Telemetry>> {
    let (log_dir, log_name) = split_path(&root.join(log_file))?;
    let (event_dir, event_name) = split_path(&root.join(event_file))?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_filter()))
        .add_directive(format!("{REPORT_TARGET}=info").parse()?);

    let txt_layer = fmt::Layer::default()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, log_name))
        .with_ansi(false);

    let json_layer = fmt::layer()
        .json()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, event_dir, event_name))
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{REPORT_TARGET}=info")));

    let telemetry = otel_endpoint.as_deref().map(Telemetry::init).transpose()?;
    let otel_layer = match &telemetry {
        Some(t) => {
            let filter = EnvFilter::new(log_level.as_filter())
                .add_directive("hyper=off".parse()?)
                .add_directive("tonic=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("reqwest=off".parse()?);
            Some(OpenTelemetryTracingBridge::new(&t.logger_provider).with_filter(filter))
        }
        None => None,
    };

    Registry::default()
        .with(otel_layer)
        .with(env_filter)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(telemetry)
}

/// Engine counters. Backed by the no-op meter unless OTLP is configured.
#[derive(Clone)]
pub struct EngineMetrics {
    pub deliveries_received: Counter<u64>,
    pub events_dispatched: Counter<u64>,
    pub gaps_detected: Counter<u64>,
    pub renewals_failed: Counter<u64>,
    pub delivery_latency_ms: Histogram<f64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let meter = global::meter_provider().meter("changefeed");
        Self {
            deliveries_received: meter
                .u64_counter("deliveries_received")
                .with_description("Inbound deliveries, authentic or not")
                .build(),
            events_dispatched: meter.u64_counter("events_dispatched").build(),
            gaps_detected: meter
                .u64_counter("gaps_detected")
                .with_description("Checkpoint resets after an expired cursor")
                .build(),
            renewals_failed: meter.u64_counter("renewals_failed").build(),
            delivery_latency_ms: meter
                .f64_histogram("delivery_latency_ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Runs `handler` and writes one JSON report line with its outcome and latency.
    pub async fn instrument<F, Fut, T, E>(&self, operation: &str, subscription_id: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let result = handler().await;
        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.delivery_latency_ms.record(elapsed, &[]);

        match &result {
            Ok(_) => info!(subscription_id, "{operation} finished in {elapsed:.1} ms"),
            Err(err) => error!(subscription_id, error = %err, "{operation} failed in {elapsed:.1} ms"),
        }
        tracing::event!(
            target: REPORT_TARGET,
            tracing::Level::INFO,
            operation,
            subscription_id,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );
        result
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instrument_passes_results_through() {
        let metrics = EngineMetrics::new();
        let ok: Result<u32, String> = metrics.instrument("deliver", "s1", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
        let err: Result<u32, String> = metrics.instrument("deliver", "s1", || async { Err("boom".to_string()) }).await;
        assert_eq!(err, Err("boom".to_string()));
    }

    #[test]
    fn split_path_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (parent, name) = split_path(&dir.path().join("logs").join("changefeed.log")).unwrap();
        assert!(parent.exists());
        assert_eq!(name, PathBuf::from("changefeed.log"));
    }
}

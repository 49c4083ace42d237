// Telemetry module for structured logging, metrics, and tracing

use crate::config::LogFormat;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const SERVICE_NAME: &str = "gitmirror";

/// Initialize structured logging
///
/// Sets up the tracing subscriber with:
/// - JSON (default) or human-readable formatting
/// - Trace context (current span and span list) in JSON entries
/// - Log level from `RUST_LOG`, falling back to the configured level
/// - Optional OpenTelemetry export when an OTLP endpoint is given
#[tracing::instrument(skip_all)]
pub fn init_logging(
    log_level: &str,
    log_format: LogFormat,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(fmt_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        log_format = ?log_format,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize the OpenTelemetry tracer with an OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Flush remaining spans. Call once on graceful shutdown.
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize the Prometheus exporter and describe the backup metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "backup_success_total",
        "Total number of successful backup pipeline runs"
    );
    describe_counter!(
        "backup_failed_total",
        "Total number of failed backup pipeline runs"
    );
    describe_histogram!(
        "backup_duration_seconds",
        "Duration of backup pipeline runs in seconds"
    );
    describe_counter!(
        "storage_upload_failed_total",
        "Total number of failed directory uploads per storage"
    );
    describe_gauge!(
        "scheduled_repositories",
        "Number of repositories with a live schedule entry"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_backup_success(repository: &str, trigger: &str) {
    counter!(
        "backup_success_total",
        "repository" => repository.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_backup_failure(repository: &str, trigger: &str, reason: &str) {
    counter!(
        "backup_failed_total",
        "repository" => repository.to_string(),
        "trigger" => trigger.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_backup_duration(repository: &str, duration_seconds: f64) {
    histogram!(
        "backup_duration_seconds",
        "repository" => repository.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn record_storage_upload_failure(repository: &str, storage: &str) {
    counter!(
        "storage_upload_failed_total",
        "repository" => repository.to_string(),
        "storage" => storage.to_string()
    )
    .increment(1);
}

#[inline]
pub fn update_scheduled_repositories(count: usize) {
    gauge!("scheduled_repositories").set(count as f64);
}

/// Consecutive failures after which a repository is reported at alert level
pub const ALERT_THRESHOLD: u32 = 3;

#[inline]
pub fn should_trigger_alert(consecutive_failures: u32) -> bool {
    consecutive_failures >= ALERT_THRESHOLD
}

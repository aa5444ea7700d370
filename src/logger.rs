use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::Result;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::trace::{FutureExt, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the newline-delimited JSON event log.
pub const EVENT_TARGET: &str = "dispatch";

const SERVICE_NAME: &str = "bothost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: PathBuf,
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(
        log_level: impl Into<String>,
        log_dir: PathBuf,
        otel_endpoint: Option<String>,
    ) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            otel_endpoint,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", PathBuf::from("logs"), None)
    }
}

/// Install the global subscriber: stdout, a daily text log, a daily JSON
/// event log and, when an endpoint is given, OTLP export of logs, traces and
/// metrics.
pub fn init_tracing(config: &LogConfig) -> Result<Telemetry> {
    std::fs::create_dir_all(&config.log_dir)?;

    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(&config.log_level));

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "bothost.log");
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(&config.log_level));

    let json_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "events.json");
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{EVENT_TARGET}=info")));

    let providers = match &config.otel_endpoint {
        Some(endpoint) => Some(OtelProviders::init(endpoint)?),
        None => None,
    };

    let otel_layer = match &providers {
        Some(p) => {
            let filter = EnvFilter::new(&config.log_level)
                .add_directive("hyper=off".parse::<Directive>()?)
                .add_directive("tonic=off".parse::<Directive>()?)
                .add_directive("h2=off".parse::<Directive>()?)
                .add_directive("reqwest=off".parse::<Directive>()?);
            Some(OpenTelemetryTracingBridge::new(&p.logger_provider).with_filter(filter))
        }
        None => None,
    };

    Registry::default()
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(p) = &providers {
        global::set_tracer_provider(p.tracer_provider.clone());
        global::set_meter_provider(p.meter_provider.clone());
        info!("exporting telemetry to {}", config.otel_endpoint.as_deref().unwrap_or_default());
    }

    Ok(Telemetry::from_meter(global::meter(SERVICE_NAME), providers))
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

#[derive(Clone)]
struct OtelProviders {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl OtelProviders {
    fn init(endpoint: &str) -> Result<Self> {
        let base = endpoint.trim_end_matches('/');

        let logs = LogExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{base}/v1/logs"))
            .build()?;
        let spans = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{base}/v1/traces"))
            .build()?;
        let metrics = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{base}/v1/metrics"))
            .build()?;

        Ok(Self {
            logger_provider: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(get_resource())
                .build(),
            tracer_provider: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(get_resource())
                .build(),
            meter_provider: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(get_resource())
                .build(),
        })
    }
}

/// Application counters plus, when exporting, the providers to flush on exit.
#[derive(Clone)]
pub struct Telemetry {
    providers: Option<OtelProviders>,
    pub webhook_events: Counter<u64>,
    pub dropped_events: Counter<u64>,
    pub lifecycle_failures: Counter<u64>,
    pub dispatch_latency_ms: Histogram<f64>,
}

impl Telemetry {
    fn from_meter(meter: Meter, providers: Option<OtelProviders>) -> Self {
        Telemetry {
            providers,
            webhook_events: meter
                .u64_counter("webhook_events")
                .with_description("Inbound webhook updates accepted")
                .build(),
            dropped_events: meter
                .u64_counter("dropped_events")
                .with_description("Updates for identities with no live runtime")
                .build(),
            lifecycle_failures: meter
                .u64_counter("lifecycle_failures")
                .with_description("Tenant starts that ended in Error")
                .build(),
            dispatch_latency_ms: meter
                .f64_histogram("dispatch_latency_ms")
                .with_description("Latency per dispatched update in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Counters backed by whatever global meter is installed (no-op by default).
    pub fn detached() -> Self {
        Self::from_meter(global::meter(SERVICE_NAME), None)
    }

    /// Run one dispatch inside a span, record its latency and emit a JSON event line.
    pub async fn instrument_dispatch<Fut, T, E>(&self, route: &str, fut: Fut) -> Result<T, E>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let span = global::tracer(SERVICE_NAME).start(format!("dispatch {route}"));
        let cx = Context::current_with_span(span);

        let result = fut.with_context(cx).await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.dispatch_latency_ms
            .record(elapsed, &[KeyValue::new("route", route.to_string())]);

        if let Err(err) = &result {
            error!(%route, error = %err, "dispatch failed after {elapsed:.1} ms");
        }
        tracing::event!(
            target: EVENT_TARGET,
            tracing::Level::INFO,
            route = route,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        result
    }

    /// Flush and stop exporters. A no-op without OTLP.
    pub fn shutdown(&self) {
        let Some(p) = &self.providers else { return };
        if let Err(e) = p.tracer_provider.shutdown() {
            error!("tracer provider shutdown: {e}");
        }
        if let Err(e) = p.meter_provider.shutdown() {
            error!("meter provider shutdown: {e}");
        }
        if let Err(e) = p.logger_provider.shutdown() {
            error!("logger provider shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instrument_dispatch_passes_result_through() {
        let telemetry = Telemetry::detached();
        let ok: Result<u8, String> = telemetry.instrument_dispatch("abc", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u8, String> = telemetry
            .instrument_dispatch("abc", async { Err("boom".to_string()) })
            .await;
        assert_eq!(err, Err("boom".to_string()));
        telemetry.shutdown();
    }

    #[test]
    fn default_log_config() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.otel_endpoint.is_none());
    }
}

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::{Layer, SubscriberExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter")]
    OtlpExporter(#[from] ExporterBuildError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Failed to spawn HTTP client thread")]
    ThreadSpawn,

    #[error("Failed to set global subscriber")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes buffered spans when dropped. Keep it alive for the lifetime of
/// the process.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let _ = self.tracer_provider.force_flush();
    }
}

/// Identifies spans emitted by this crate's own instrumentation, as opposed
/// to the `service.name` resource attribute that identifies the process.
const TRACER_NAME: &str = "leadership-league";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub api_key: String,
    pub endpoint: String,
    pub service_name: String,
}

pub(crate) fn default_filter(log_level: tracing::Level) -> String {
    format!("leadership_league={log_level},league_broker={log_level},rocket=warn")
}

pub fn setup_telemetry(
    config: &TelemetryConfig,
    log_level: tracing::Level,
) -> Result<TelemetryGuard, TelemetryError> {
    let headers = HashMap::from([("authorization".to_string(), config.api_key.clone())]);

    // The blocking client owns a runtime and must not be built on a tokio
    // worker thread.
    let http_client = std::thread::spawn(|| {
        reqwest::blocking::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| e.to_string())
    })
    .join()
    .map_err(|_| TelemetryError::ThreadSpawn)?
    .map_err(TelemetryError::HttpClient)?;

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_http_client(http_client)
        .with_endpoint(config.endpoint.clone())
        .with_headers(headers)
        .build()?;

    let batch_exporter = BatchSpanProcessor::builder(otlp_exporter)
        .with_batch_config(
            BatchConfigBuilder::default()
                .with_max_export_batch_size(512)
                .with_max_queue_size(2048)
                .with_scheduled_delay(Duration::from_secs(3))
                .build(),
        )
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_span_processor(batch_exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name.clone())
                .with_attributes(vec![KeyValue::new("deployment.environment", "production")])
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(TRACER_NAME);
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let default_filter = default_filter(log_level);

    let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.clone().into());
    let telemetry_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(fmt_filter);
    let telemetry_layer = telemetry_layer.with_filter(telemetry_filter);

    let subscriber = Registry::default().with(fmt_layer).with(telemetry_layer);

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(TelemetryGuard { tracer_provider })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_both_crates() {
        let filter = default_filter(tracing::Level::INFO);
        assert_eq!(
            filter,
            "leadership_league=INFO,league_broker=INFO,rocket=warn"
        );
    }
}

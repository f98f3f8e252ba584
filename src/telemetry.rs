//! OpenTelemetry export for scenario spans
//!
//! Enabled by the binary when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, so long
//! runs can be inspected phase by phase in a tracing backend.

use std::env;

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{Config, Sampler};
use tracing_subscriber::{registry::LookupSpan, Layer};

use crate::error::{Error, Result};

pub const SERVICE_NAME: &str = "velero-e2e";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

fn telemetry_resource() -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ])
}

/// Build the tracing layer that exports spans over OTLP/gRPC.
pub fn init_telemetry<S>(_subscriber: &S) -> Result<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&otlp_endpoint)
        .build_span_exporter()
        .map_err(|e| Error::ConfigError(format!("failed to build OTLP exporter: {e}")))?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_config(
            Config::default()
                .with_resource(telemetry_resource())
                .with_sampler(Sampler::AlwaysOn),
        )
        .with_batch_exporter(exporter, runtime::Tokio)
        .build();

    let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, SERVICE_NAME);
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer).boxed())
}

/// Flush pending spans.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::Key;

    #[test]
    fn resource_names_the_harness() {
        let resource = telemetry_resource();
        assert_eq!(
            resource.get(Key::new("service.name")),
            Some(opentelemetry::Value::from(SERVICE_NAME))
        );
    }
}

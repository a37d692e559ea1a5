//! OTLP/HTTP span export, layered over [`crate::logging`].

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::logging;

/// Flushes pending spans when dropped.
#[derive(Debug)]
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            tracing::warn!(error = %err, "span exporter shutdown failed");
        }
    }
}

/// Batching provider for `service_name`. `endpoint` overrides the OTLP env defaults.
fn tracer_provider(
    service_name: &str,
    endpoint: Option<&str>,
) -> Result<SdkTracerProvider, Box<dyn std::error::Error>> {
    let builder = SpanExporter::builder().with_http();
    let exporter = match endpoint {
        Some(endpoint) => builder.with_endpoint(endpoint).build()?,
        None => builder.build()?,
    };
    let resource = Resource::builder_empty()
        .with_service_name(service_name.to_string())
        .build();
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

/// [`logging::init_tracing`] plus a span layer exporting to OTLP.
pub fn init_tracing(
    service_name: &str,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<OtelGuard, Box<dyn std::error::Error>> {
    let provider = tracer_provider(service_name, endpoint)?;
    global::set_tracer_provider(provider.clone());
    let span_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()));

    tracing_subscriber::registry()
        .with(logging::env_filter())
        .with(logging::fmt_layer(json_logs))
        .with(span_layer)
        .try_init()?;
    tracing::info!(service_name, "exporting spans over OTLP/HTTP");
    Ok(OtelGuard { provider })
}

//! Log and trace setup
//!
//! Console (or JSON) logging through `tracing-subscriber`. With the `otel`
//! feature, spans are also exported over OTLP:
//!
//! ```text
//! polyflow → OTLP (gRPC) → OTel Collector → Tempo (traces)
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,polyflow=debug";

/// Default OTLP endpoint (OTel collector)
#[cfg(feature = "otel")]
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Initialize the tracing subsystem
///
/// # Arguments
/// * `service_name` - Name for the service in traces
/// * `json` - Emit JSON log lines instead of the human format
/// * `otlp_endpoint` - OTLP collector URL; only honoured with the `otel` feature
pub fn init_tracing(
    service_name: &str,
    json: bool,
    otlp_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    #[cfg(feature = "otel")]
    {
        let endpoint = otlp_endpoint.unwrap_or(DEFAULT_OTLP_ENDPOINT);
        let tracer = otlp_tracer(service_name, endpoint)?;
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
        tracing::info!(service = service_name, endpoint = endpoint, "OpenTelemetry tracing initialized");
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = otlp_endpoint;
        registry.try_init()?;
        tracing::debug!(service = service_name, "Tracing initialized");
    }

    Ok(())
}

#[cfg(feature = "otel")]
fn otlp_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer, opentelemetry::trace::TraceError> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)
}

/// Flush pending spans (no-op without the `otel` feature)
pub fn shutdown_tracing() {
    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();
}

//! Logging, tracing and metrics export for the controller binary
//!
//! Logs are JSON lines on stdout, filtered by `RUST_LOG`. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans and the meters in
//! [`crate::metrics`] are also pushed over OTLP/gRPC.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::Error;

/// Log filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,nodeops=debug,kube=info,tower=warn,hyper=warn";

/// Downward-API variables copied onto the OTel resource
const K8S_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` on exported spans and metrics
    pub service_name: String,
    /// OTLP collector endpoint; export is off when `None`
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "nodeops".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
        }
    }
}

/// Keeps exporters alive; call [`TelemetryGuard::shutdown`] before exit to flush
#[must_use]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Flush and stop the OTLP exporters, if any
    pub fn shutdown(self) {
        if let Some(tracer) = self.tracer {
            if let Err(e) = tracer.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(meter) = self.meter {
            if let Err(e) = meter.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global subscriber and, if configured, OTLP exporters
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, Error> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut guard = TelemetryGuard {
        tracer: None,
        meter: None,
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = resource(&config.service_name);
            let meter = meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter.clone());
            guard.meter = Some(meter);

            let provider = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(config.service_name.clone());
            guard.tracer = Some(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::internal("telemetry", e.to_string()))?;

    Ok(guard)
}

fn resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    for (var, key) in K8S_ATTRIBUTES {
        if let Ok(value) = std::env::var(var) {
            attributes.push(KeyValue::new(key, value));
        }
    }
    Resource::new(attributes)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, Error> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::internal("telemetry", format!("span exporter: {e}")))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, Error> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::internal("telemetry", format!("metric exporter: {e}")))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}

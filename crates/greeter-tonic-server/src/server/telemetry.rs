//! # Telemetry
//!
//! Console logging through `tracing-subscriber` is always on. OpenTelemetry
//! export is opt-in through cargo features:
//!
//! - `otel-tracing`: exports `tracing` spans (one per call, see
//!   [`RequestContext`](crate::server::service::context::RequestContext)).
//! - `otel-metrics`: exports the call counters and histograms below.
//! - `otlp`: OTLP/gRPC exporter. Reads `OTEL_EXPORTER_OTLP_ENDPOINT`, and
//!   optionally `OTEL_EXPORTER_OTLP_HEADERS` (`k1=v1,k2=v2`) and
//!   `OTEL_EXPORTER_OTLP_COMPRESSION` (`gzip` or `zstd`).
//! - `stdout`: prints spans and metrics to stdout.
//!
//! Exporters require at least one of `otel-tracing` or `otel-metrics`.
//!
//! ## Metrics
//!
//! | name              | kind              | attributes |
//! |-------------------|-------------------|------------|
//! | `calls`           | counter           | `method`   |
//! | `calls_inflight`  | up/down counter   | `method`   |
//! | `call_errors`     | counter           | `method`   |
//! | `call_duration`   | histogram (ms)    | `method`   |
//! | `replies_sent`    | counter           | `method`   |
//! | `names_per_call`  | histogram         |            |
//!
//! Without `otel-metrics` every recording function is an empty inline
//! function.
//!
//! ```bash
//! cargo run --features otel-tracing,otel-metrics,stdout
//! OTEL_EXPORTER_OTLP_ENDPOINT=https://collector:4317 cargo run --features otel-tracing,otlp
//! ```

#[cfg(all(
    feature = "otlp",
    not(any(feature = "otel-tracing", feature = "otel-metrics"))
))]
compile_error!(
    "The 'otlp' feature requires at least one of 'otel-tracing' or 'otel-metrics' to be enabled."
);

#[cfg(all(
    feature = "stdout",
    not(any(feature = "otel-tracing", feature = "otel-metrics"))
))]
compile_error!(
    "The 'stdout' feature requires at least one of 'otel-tracing' or 'otel-metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "otel-metrics", feature = "otel-tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", any(feature = "otel-metrics", feature = "otel-tracing")))]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

#[cfg(feature = "otel-metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "otel-metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "otel-metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel-tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "greeter";

/// Exporter handles that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "otel-tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "otel-metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every enabled exporter. Failures are reported on
    /// stderr since the subscriber may already be unusable.
    pub fn shutdown(&self) {
        #[cfg(feature = "otel-tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {:#?}", err);
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {:#?}", err);
            }
        }

        #[cfg(feature = "otel-metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {:#?}", err);
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {:#?}", err);
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel-tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel-tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "otel-metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Human-readable console output, independent of any exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel-tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "otel-metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "otel-tracing")]
        tracer_provider,
        #[cfg(feature = "otel-metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "otel-metrics", feature = "otel-tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Connection settings shared by the OTLP span and metric exporters.
#[cfg(all(feature = "otlp", any(feature = "otel-metrics", feature = "otel-tracing")))]
struct OtlpSettings {
    endpoint: String,
    metadata: MetadataMap,
    compression: Option<Compression>,
}

#[cfg(all(feature = "otlp", any(feature = "otel-metrics", feature = "otel-tracing")))]
impl OtlpSettings {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .context("missing `OTEL_EXPORTER_OTLP_ENDPOINT`")?;

        let mut metadata = MetadataMap::new();
        if let Ok(raw) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
            for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("malformed OTLP header `{pair}`"))?;
                let key = tonic::metadata::AsciiMetadataKey::from_bytes(key.trim().as_bytes())
                    .with_context(|| format!("invalid OTLP header name `{key}`"))?;
                metadata.insert(key, value.trim().parse().context("invalid OTLP header value")?);
            }
        }

        let compression = match std::env::var("OTEL_EXPORTER_OTLP_COMPRESSION") {
            Ok(raw) => Some(Compression::from_str(&raw.to_ascii_lowercase())?),
            Err(_) => None,
        };

        Ok(Self {
            endpoint,
            metadata,
            compression,
        })
    }
}

#[cfg(feature = "otel-metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let settings = OtlpSettings::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(sdkmetrics::Temporality::Delta);
        let exporter = match settings.compression {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        };
        builder.with_periodic_exporter(exporter.build().context("failed to build metrics exporter")?)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel-tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batch_processor(
        opentelemetry_stdout::SpanExporter::default(),
    ));

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let settings = OtlpSettings::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc);
        let exporter = match settings.compression {
            Some(compression) => exporter.with_compression(compression),
            None => exporter,
        };
        builder.with_span_processor(batch_processor(
            exporter.build().context("failed to build tracer exporter")?,
        ))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "otel-tracing", any(feature = "stdout", feature = "otlp")))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "otel-metrics")]
struct CallMetrics {
    calls: Counter<u64>,
    calls_inflight: UpDownCounter<i64>,
    call_errors: Counter<u64>,
    call_duration_ms: Histogram<f64>,
    replies_sent: Counter<u64>,
    names_per_call: Histogram<f64>,
}

#[cfg(feature = "otel-metrics")]
static METRICS: OnceLock<CallMetrics> = OnceLock::new();

#[cfg(feature = "otel-metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = METRICS.set(CallMetrics {
        calls: meter
            .u64_counter("calls")
            .with_description("Total gRPC calls accepted")
            .build(),
        calls_inflight: meter
            .i64_up_down_counter("calls_inflight")
            .with_description("Calls currently in flight")
            .build(),
        call_errors: meter
            .u64_counter("call_errors")
            .with_description("Calls that ended with an error status")
            .build(),
        call_duration_ms: meter
            .f64_histogram("call_duration")
            .with_unit("ms")
            .with_description("End-to-end call duration")
            .build(),
        replies_sent: meter
            .u64_counter("replies_sent")
            .with_description("Greeting replies produced")
            .build(),
        names_per_call: meter
            .f64_histogram("names_per_call")
            .with_description("Names collected per client-streaming call")
            .build(),
    });
}

#[cfg(feature = "otel-metrics")]
fn with_metrics(f: impl FnOnce(&CallMetrics)) {
    if let Some(metrics) = METRICS.get() {
        f(metrics);
    }
}

#[cfg(feature = "otel-metrics")]
fn method_attr(method: &'static str) -> [KeyValue; 1] {
    [KeyValue::new("method", method)]
}

#[cfg(feature = "otel-metrics")]
pub fn increment_calls(method: &'static str) {
    with_metrics(|m| m.calls.add(1, &method_attr(method)));
}

#[cfg(not(feature = "otel-metrics"))]
#[inline]
pub fn increment_calls(_method: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn increment_calls_inflight(method: &'static str) {
    with_metrics(|m| m.calls_inflight.add(1, &method_attr(method)));
}

#[cfg(not(feature = "otel-metrics"))]
#[inline]
pub fn increment_calls_inflight(_method: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn decrement_calls_inflight(method: &'static str) {
    with_metrics(|m| m.calls_inflight.add(-1, &method_attr(method)));
}

#[cfg(not(feature = "otel-metrics"))]
#[inline]
pub fn decrement_calls_inflight(_method: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn increment_call_errors(method: &'static str) {
    with_metrics(|m| m.call_errors.add(1, &method_attr(method)));
}

#[cfg(not(feature = "otel-metrics"))]
#[inline]
pub fn increment_call_errors(_method: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn record_call_duration(method: &'static str, duration_ms: f64) {
    with_metrics(|m| m.call_duration_ms.record(duration_ms, &method_attr(method)));
}

#[cfg(not(feature = "otel-metrics"))]
#[inline]
pub fn record_call_duration(_method: &'static str, _duration_ms: f64) {}

#[cfg(feature = "otel-metrics")]
pub fn increment_replies_sent(method: &'static str) {
    with_metrics(|m| m.replies_sent.add(1, &method_attr(method)));
}

#[cfg(not(feature = "otel-metrics"))]
#[inline]
pub fn increment_replies_sent(_method: &'static str) {}

#[cfg(feature = "otel-metrics")]
pub fn record_names_per_call(count: f64) {
    with_metrics(|m| m.names_per_call.record(count, &[]));
}

#[cfg(not(feature = "otel-metrics"))]
#[inline]
pub fn record_names_per_call(_count: f64) {}

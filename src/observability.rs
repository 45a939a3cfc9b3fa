//! Sets up structured logging and, when an OTLP collector is
//! configured, span export. Also carries the trace context that links
//! a store event to its invocation.

use anyhow::Result;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, Context};
use opentelemetry_aws::trace::XrayPropagator;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// The service name attached to exported spans.
pub const SERVICE_NAME: &str = "image-label-bridge";

/// Header carrying the X-Ray trace id, lowercase as propagators
/// expect it.
const XRAY_HEADER: &str = "x-amzn-trace-id";

/// Environment variable set by the Lambda runtime with the X-Ray
/// trace header of the current invocation.
pub const XRAY_ENV_VAR: &str = "_X_AMZN_TRACE_ID";

/// The trace context of the delivery that produced an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// An X-Ray trace header, as in
    /// `Root=1-...;Parent=...;Sampled=1`.
    pub trace_header: Option<String>,
}

impl TraceContext {
    pub fn from_xray(trace_header: Option<String>) -> Self {
        Self {
            trace_header: trace_header.filter(|h| !h.is_empty()),
        }
    }

    /// Read the trace header the Lambda runtime exposes.
    pub fn from_env() -> Self {
        Self::from_xray(env::var(XRAY_ENV_VAR).ok())
    }

    /// The remote parent of the invocation span, or an empty context
    /// if the header is absent or invalid.
    pub fn parent(&self) -> Context {
        match &self.trace_header {
            Some(header) => {
                let carrier = HashMap::from([(XRAY_HEADER.to_string(), header.clone())]);
                XrayPropagator::default().extract(&carrier)
            }
            None => Context::new(),
        }
    }
}

/// Handle to the installed telemetry pipeline.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Export buffered spans. The Lambda environment may freeze the
    /// process right after an invocation returns.
    pub fn flush(&self) {
        if let Some(provider) = &self.provider {
            if let Err(e) = provider.force_flush() {
                warn!("Failed to flush spans: {}", e);
            }
        }
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                warn!("Failed to shut down the tracer provider: {}", e);
            }
        }
    }
}

/// Initialize the global subscriber. Logs are JSON unless
/// `LOG_FORMAT=text`; the level is taken from `RUST_LOG`. Spans are
/// exported through OTLP only if `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init() -> Result<Telemetry> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let text = env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("text"))
        .unwrap_or(false);

    let provider = if env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_timeout(Duration::from_secs(3))
            .build()?;
        Some(
            SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
                .build(),
        )
    } else {
        None
    };
    let telemetry_layer = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(telemetry_layer);
    if text {
        registry
            .with(fmt::layer().with_target(false).without_time())
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?;
    }
    if let Some(provider) = &provider {
        global::set_tracer_provider(provider.clone());
    }
    Ok(Telemetry { provider })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanId, TraceContextExt, TraceId};

    #[test]
    fn xray_header_becomes_remote_parent() {
        let trace = TraceContext::from_xray(Some(String::from(
            "Root=1-65dc5008-1561ed7046ffcbcb114af027;Parent=b510129166d5a083;Sampled=1",
        )));
        let parent = trace.parent();
        let span_context = parent.span().span_context().clone();
        assert!(span_context.is_remote());
        assert_eq!(
            span_context.trace_id(),
            TraceId::from_hex("65dc50081561ed7046ffcbcb114af027").unwrap()
        );
        assert_eq!(
            span_context.span_id(),
            SpanId::from_hex("b510129166d5a083").unwrap()
        );
    }

    #[test]
    fn missing_header_yields_empty_context() {
        let trace = TraceContext::from_xray(Some(String::new()));
        assert_eq!(trace.trace_header, None);
        assert!(!trace.parent().span().span_context().is_valid());
    }
}

//! Exporting traces via OTLP and reporting errors to Sentry.

use hyper::{HeaderMap, StatusCode};
use opentelemetry::{KeyValue, propagation::Extractor, trace::TracerProvider as _};
use opentelemetry_otlp::{SpanExporterBuilder, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::TraceContextPropagator,
    trace::{Config, TracerProvider},
};
use secrecy::{ExposeSecret, SecretString};
use sentry::{SentryFutureExt, TransactionContext, protocol::SpanStatus};
use std::{convert::Infallible, future::Future, sync::Arc, time::Duration};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{Layer, registry::LookupSpan};

use crate::{api::RequestMeta, prelude::*};


#[derive(Debug, Clone, confique::Config)]
pub(crate) struct TelemetryConfig {
    /// Service name attached to all exported spans.
    #[config(env = "SERVICE_NAME", default = "postgraph")]
    pub(crate) service_name: String,

    /// Whether to export spans to Jaeger (via its OTLP gRPC endpoint).
    #[config(env = "JAEGER_EXPORTER", parse_env = parse_flag, default = false)]
    pub(crate) jaeger_exporter: bool,

    /// OTLP gRPC endpoint of Jaeger.
    #[config(default = "http://localhost:4317")]
    pub(crate) jaeger_endpoint: String,

    /// Whether to export spans to Lightstep. Requires `lightstep_access_token`.
    #[config(env = "LIGHTSTEP_EXPORTER", parse_env = parse_flag, default = false)]
    pub(crate) lightstep_exporter: bool,

    /// OTLP gRPC endpoint of Lightstep.
    #[config(default = "https://ingest.lightstep.com:443")]
    pub(crate) lightstep_endpoint: String,

    /// Access token for Lightstep.
    #[config(env = "LS_ACCESS_TOKEN")]
    pub(crate) lightstep_access_token: Option<SecretString>,
}

impl TelemetryConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.lightstep_exporter && self.lightstep_access_token.is_none() {
            bail!("`telemetry.lightstep_exporter` is enabled, but no access token is set \
                (`telemetry.lightstep_access_token` or `LS_ACCESS_TOKEN`)");
        }
        Ok(())
    }

    fn any_exporter(&self) -> bool {
        self.jaeger_exporter || self.lightstep_exporter
    }
}

#[derive(Debug, Clone, confique::Config)]
pub(crate) struct SentryConfig {
    /// Sentry DSN. Error reporting is disabled if this is not set.
    #[config(env = "SENTRY_DSN")]
    pub(crate) dsn: Option<SecretString>,

    /// The environment reported to Sentry, e.g. "production".
    #[config(env = "NODE_ENV")]
    pub(crate) environment: Option<String>,

    /// Makes the Sentry client print debug information.
    #[config(env = "SENTRY_DEBUG", parse_env = parse_flag, default = false)]
    pub(crate) debug: bool,

    /// Fraction of transactions sent to Sentry, between 0 and 1.
    #[config(default = 1.0)]
    pub(crate) traces_sample_rate: f32,
}

impl SentryConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.traces_sample_rate) {
            bail!("`sentry.traces_sample_rate` has to be between 0 and 1");
        }
        if let Some(dsn) = &self.dsn {
            dsn.expose_secret().parse::<sentry::types::Dsn>()
                .context("`sentry.dsn` is not a valid DSN")?;
        }
        Ok(())
    }
}

/// Environment flags are set if they are non-empty and not "0" or "false".
fn parse_flag(s: &str) -> Result<bool, Infallible> {
    let s = s.trim();
    Ok(!s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"))
}


// ===== Tracing ==================================================================================

/// Builds the tracing layer that exports spans via OTLP, or `None` if no
/// exporter is enabled. Also installs the global tracer provider, which is
/// shut down by `shutdown_tracing`.
pub(crate) fn tracing_layer<S>(
    config: &TelemetryConfig,
) -> Result<Option<Box<dyn Layer<S> + Send + Sync>>>
where
    S: Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
{
    if !config.any_exporter() {
        return Ok(None);
    }

    let resource = Resource::new([KeyValue::new("service.name", config.service_name.clone())]);
    let mut builder = TracerProvider::builder()
        .with_config(Config::default().with_resource(resource));

    if config.jaeger_exporter {
        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(&config.jaeger_endpoint);
        let span_exporter = SpanExporterBuilder::Tonic(exporter).build_span_exporter()
            .context("failed to create Jaeger span exporter")?;
        builder = builder.with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio);
    }

    if config.lightstep_exporter {
        let mut metadata = tonic::metadata::MetadataMap::new();
        if let Some(token) = &config.lightstep_access_token {
            let value = token.expose_secret().parse()
                .context("Lightstep access token is not a valid header value")?;
            metadata.insert("lightstep-access-token", value);
        }

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(&config.lightstep_endpoint)
            .with_metadata(metadata);
        let span_exporter = SpanExporterBuilder::Tonic(exporter).build_span_exporter()
            .context("failed to create Lightstep span exporter")?;
        builder = builder.with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio);
    }

    let provider = builder.build();
    let _ = opentelemetry::global::set_tracer_provider(provider.clone());
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    Ok(Some(
        tracing_opentelemetry::layer()
            .with_tracer(provider.tracer("postgraph"))
            .boxed(),
    ))
}

/// Makes the trace context sent by the client (W3C `traceparent` header) the
/// parent of `span`. Without a propagator or header, `span` starts a new trace.
pub(crate) fn set_remote_parent(span: &tracing::Span, headers: &HeaderMap) {
    let cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });
    span.set_parent(cx);
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Flushes all pending spans and shuts down the global tracer provider.
pub(crate) async fn shutdown_tracing() {
    // Shutting down blocks until the exporters are done.
    let result = tokio::task::spawn_blocking(opentelemetry::global::shutdown_tracer_provider).await;
    match result {
        Ok(()) => debug!("Shut down tracer provider"),
        Err(e) => warn!("Failed to shut down tracer provider: {e}"),
    }
}


// ===== Error reporting ==========================================================================

/// Handle to the Sentry client. Events go to the client of the current hub,
/// so without a DSN, all methods are no-ops.
#[derive(Clone)]
pub(crate) struct ErrorReporter {
    guard: Option<Arc<sentry::ClientInitGuard>>,
}

impl ErrorReporter {
    pub(crate) fn init(config: &SentryConfig) -> Result<Self> {
        let Some(dsn) = &config.dsn else {
            debug!("No Sentry DSN configured: error reporting is disabled");
            return Ok(Self::disabled());
        };

        let dsn = dsn.expose_secret().parse::<sentry::types::Dsn>()
            .context("invalid Sentry DSN")?;
        let guard = sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            environment: config.environment.clone().map(Into::into),
            debug: config.debug,
            traces_sample_rate: config.traces_sample_rate,
            release: sentry::release_name!(),
            ..Default::default()
        });
        info!(
            "Initialized Sentry error reporting (environment: {})",
            config.environment.as_deref().unwrap_or("<none>"),
        );

        Ok(Self { guard: Some(Arc::new(guard)) })
    }

    /// A reporter that does not initialize Sentry itself.
    pub(crate) fn disabled() -> Self {
        Self { guard: None }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        sentry::Hub::current().client().is_some_and(|client| client.is_enabled())
    }

    /// Runs the request handler `future` with its own Sentry hub tagged with
    /// the request path and ID, inside a Sentry transaction. Everything
    /// captured while it runs, including panics, carries these tags. The
    /// transaction is finished with a status derived from the response.
    pub(crate) async fn bind<B>(
        &self,
        meta: &RequestMeta,
        future: impl Future<Output = hyper::Response<B>>,
    ) -> hyper::Response<B> {
        if !self.is_enabled() {
            return future.await;
        }

        let hub = Arc::new(sentry::Hub::new_from_top(sentry::Hub::current()));
        let transaction = hub.start_transaction(
            TransactionContext::new("HTTP request handler", &meta.path),
        );
        hub.configure_scope(|scope| {
            scope.set_tag("path", &meta.path);
            scope.set_extra("request ID", meta.request_id.clone().into());
            scope.set_span(Some(transaction.clone().into()));
        });

        async move {
            let response = future.await;
            transaction.set_status(span_status(response.status()));
            transaction.finish();
            response
        }.bind_hub(hub).await
    }

    /// Reports an error to the hub of the current request.
    pub(crate) fn report(&self, message: &str) {
        if self.is_enabled() {
            sentry::capture_message(message, sentry::Level::Error);
        }
    }

    /// Sends all queued events, waiting at most `timeout`.
    pub(crate) fn flush(&self, timeout: Duration) {
        if let Some(guard) = &self.guard {
            if guard.flush(Some(timeout)) {
                debug!("Flushed Sentry events");
            } else {
                warn!("Timed out flushing Sentry events after {timeout:?}");
            }
        }
    }
}

fn span_status(status: StatusCode) -> SpanStatus {
    match status.as_u16() {
        ..=399 => SpanStatus::Ok,
        404 => SpanStatus::NotFound,
        413 => SpanStatus::FailedPrecondition,
        400..=499 => SpanStatus::InvalidArgument,
        503 => SpanStatus::Unavailable,
        _ => SpanStatus::InternalError,
    }
}

/// Extracts the messages of all errors with kind `INTERNAL_SERVER_ERROR` from
/// a serialized GraphQL response (or batch of responses).
pub(crate) fn internal_errors(response: &serde_json::Value) -> Vec<&str> {
    let responses = match response {
        serde_json::Value::Array(responses) => responses.iter().collect(),
        single => vec![single],
    };

    responses.into_iter()
        .filter_map(|r| r.get("errors")?.as_array())
        .flatten()
        .filter(|e| {
            e.pointer("/extensions/kind").and_then(|k| k.as_str())
                == Some(crate::api::err::ApiErrorKind::INTERNAL_SERVER_ERROR)
        })
        .filter_map(|e| e.get("message")?.as_str())
        .collect()
}


#[cfg(test)]
mod tests {
    use confique::Config as _;
    use hyper::{HeaderMap, StatusCode, header::HeaderValue};
    use opentelemetry::trace::{TraceContextExt as _, TraceId, TracerProvider as _};
    use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::TracerProvider};
    use secrecy::SecretString;
    use sentry::protocol::{Context, EnvelopeItem, SpanStatus};
    use serde_json::json;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;
    use tracing_subscriber::layer::SubscriberExt as _;

    use crate::api::RequestMeta;
    use super::{
        ErrorReporter, SentryConfig, TelemetryConfig, internal_errors, parse_flag,
        set_remote_parent,
    };

    #[test]
    fn flags() {
        for s in ["1", "true", "yes", "TRUE"] {
            assert_eq!(parse_flag(s), Ok(true), "{s}");
        }
        for s in ["", " ", "0", "false", "False"] {
            assert_eq!(parse_flag(s), Ok(false), "{s}");
        }
    }

    #[test]
    fn lightstep_needs_token() {
        let mut config = TelemetryConfig::builder().load().unwrap();
        assert!(config.validate().is_ok());

        config.lightstep_exporter = true;
        assert!(config.validate().is_err());

        config.lightstep_access_token = Some(SecretString::from("token"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sentry_dsn_is_validated() {
        let mut config = SentryConfig::builder().load().unwrap();
        assert!(config.validate().is_ok());

        config.dsn = Some(SecretString::from("not a dsn"));
        assert!(config.validate().is_err());

        config.dsn = Some(SecretString::from("https://public@sentry.example.com/1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn extracts_internal_errors_only() {
        let response = json!({
            "data": null,
            "errors": [
                { "message": "bad", "extensions": { "kind": "INVALID_INPUT" } },
                {
                    "message": "database operation failed",
                    "extensions": { "kind": "INTERNAL_SERVER_ERROR" },
                },
                { "message": "Unknown field" },
            ],
        });
        assert_eq!(
            internal_errors(&response),
            ["database operation failed"],
        );

        let batch = json!([
            { "data": { "allUsers": [] } },
            response,
        ]);
        assert_eq!(internal_errors(&batch).len(), 1);
        assert!(internal_errors(&json!({ "data": {} })).is_empty());
    }

    #[test]
    fn traceparent_header_becomes_parent() {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let provider = TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        ));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("http_request");
            set_remote_parent(&span, &headers);
            let cx = span.context();
            assert_eq!(
                cx.span().span_context().trace_id(),
                TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            );

            let unrelated = tracing::info_span!("http_request");
            set_remote_parent(&unrelated, &HeaderMap::new());
            assert_ne!(
                unrelated.context().span().span_context().trace_id(),
                cx.span().span_context().trace_id(),
            );
        });
    }

    #[test]
    fn requests_are_sentry_transactions() {
        let meta = RequestMeta { path: "/graphql".into(), request_id: "req-7".into() };
        let options = sentry::ClientOptions { traces_sample_rate: 1.0, ..Default::default() };
        let envelopes = sentry::test::with_captured_envelopes_options(|| {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let response = rt.block_on(ErrorReporter::disabled().bind(&meta, async {
                hyper::Response::builder().status(StatusCode::NOT_FOUND).body(()).unwrap()
            }));
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }, options);

        let transactions = envelopes.iter()
            .flat_map(|envelope| envelope.items())
            .filter_map(|item| match item {
                EnvelopeItem::Transaction(transaction) => Some(transaction),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(transactions.len(), 1);

        let transaction = transactions[0];
        assert_eq!(transaction.name.as_deref(), Some("HTTP request handler"));
        assert_eq!(transaction.tags.get("path").map(String::as_str), Some("/graphql"));
        let Some(Context::Trace(trace)) = transaction.contexts.get("trace") else {
            panic!("transaction has no trace context");
        };
        assert_eq!(trace.op.as_deref(), Some("/graphql"));
        assert_eq!(trace.status, Some(SpanStatus::NotFound));
    }

    #[tokio::test]
    async fn without_client_bind_just_runs_the_handler() {
        let meta = RequestMeta { path: "/".into(), request_id: "req-1".into() };
        let reporter = ErrorReporter::disabled();
        assert!(!reporter.is_enabled());
        let response = reporter.bind(&meta, async {
            hyper::Response::builder().status(StatusCode::OK).body(()).unwrap()
        }).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

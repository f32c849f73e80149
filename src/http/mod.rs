//! The HTTP server, handler and routes.
//!
//! This file itself contains fairly little business logic and just sets up the
//! `hyper` server, catches errors and coordinates the shutdown. The main logic
//! is in `handlers.rs` and `graphql.rs`.

use bytes::Bytes;
use deadpool_postgres::Pool;
use futures::FutureExt;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto, graceful::GracefulShutdown},
};
use std::{
    convert::Infallible,
    future::Future,
    net::{IpAddr, SocketAddr},
    panic::AssertUnwindSafe,
    sync::{Arc, atomic::{AtomicU64, Ordering}},
    time::Duration,
};
use tokio::net::TcpListener;

use crate::{
    api,
    config::Config,
    metrics::Metrics,
    prelude::*,
    telemetry::ErrorReporter,
};
use self::handlers::handle;


mod graphql;
mod handlers;
mod log;
mod response;


/// Paths that are always taken and cannot be used for the explorer.
const RESERVED_PATHS: &[&str] = &["/", "/graphql", "/~metrics"];

/// HTTP server configuration.
#[derive(Debug, Clone, confique::Config)]
pub(crate) struct HttpConfig {
    /// The TCP port the HTTP server should listen on.
    #[config(env = "PORT", default = 3000)]
    pub(crate) port: u16,

    /// The bind address to listen on.
    #[config(default = "0.0.0.0")]
    pub(crate) address: IpAddr,

    /// Path under which the interactive GraphQL explorer is served. It is
    /// also always reachable under `/graphiql`.
    #[config(default = "/altair")]
    pub(crate) explorer_path: String,

    /// How long to wait for open connections to finish their requests when
    /// shutting down. Connections still open after this time are dropped.
    #[config(default = "10s", deserialize_with = crate::config::deserialize_duration)]
    pub(crate) shutdown_timeout: Duration,

    /// Maximum size of request bodies in bytes.
    #[config(default = 1_048_576)]
    pub(crate) max_body_size: usize,
}

impl HttpConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let path = self.explorer_path.trim_end_matches('/');
        if !self.explorer_path.starts_with('/') {
            bail!("`http.explorer_path` has to start with '/'");
        }
        if path.is_empty() || RESERVED_PATHS.contains(&path) {
            bail!("`http.explorer_path` cannot be '{}' as that route is already taken", path);
        }
        Ok(())
    }
}


// Our responses always have a fully buffered body.
type Response<T = Full<Bytes>> = hyper::Response<T>;
type Request<T> = hyper::Request<T>;


/// Context that the request handler has access to.
struct Context {
    api_root: api::RootNode,
    db_pool: Pool,
    config: Config,
    reporter: ErrorReporter,
    metrics: Metrics,
    request_counter: AtomicU64,
}

impl Context {
    fn new(config: Config, api_root: api::RootNode, db_pool: Pool, reporter: ErrorReporter) -> Self {
        Self {
            api_root,
            db_pool,
            config,
            reporter,
            metrics: Metrics::new(),
            request_counter: AtomicU64::new(0),
        }
    }

    /// Returns a new ID for an incoming request, unique within this process.
    fn next_request_id(&self) -> String {
        format!("req-{}", self.request_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }
}


/// Starts the HTTP server and serves requests until `shutdown` resolves.
/// Then the server stops accepting connections, waits for the open ones (at
/// most `http.shutdown_timeout`) and closes the DB pool.
pub(crate) async fn serve(
    config: Config,
    api_root: api::RootNode,
    db_pool: Pool,
    reporter: ErrorReporter,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr = SocketAddr::new(config.http.address, config.http.port);
    let listener = TcpListener::bind(addr).await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!("Listening on http://{}", listener.local_addr().unwrap_or(addr));

    let ctx = Arc::new(Context::new(config, api_root, db_pool, reporter));
    run(listener, Arc::clone(&ctx), shutdown).await;

    ctx.db_pool.close();
    info!("Closed database connection pool");
    Ok(())
}

async fn run(listener: TcpListener, ctx: Arc<Context>, shutdown: impl Future<Output = ()>) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        continue;
                    }
                };
                trace!("Accepted connection from {peer}");

                let ctx = Arc::clone(&ctx);
                let service = service_fn(move |req| {
                    handle_internal_errors(handle(req, Arc::clone(&ctx)))
                });
                let conn = builder.serve_connection(TokioIo::new(stream), service).into_owned();
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("Error serving connection from {peer}: {e}");
                    }
                });
            }

            _ = &mut shutdown => break,
        }
    }

    // Stop accepting new connections.
    drop(listener);

    let timeout = ctx.config.http.shutdown_timeout;
    info!("Waiting for open connections to finish (at most {timeout:?})...");
    tokio::select! {
        _ = graceful.shutdown() => debug!("All connections closed"),
        _ = tokio::time::sleep(timeout) => {
            warn!("Open connections did not finish within {timeout:?}, dropping them");
        }
    }
}

/// This just wraps another future and catches all panics that might occur when
/// resolving/polling that given future. This ensures that we always answer with
/// `500` instead of just crashing the thread and closing the connection.
async fn handle_internal_errors(
    future: impl Future<Output = Response>,
) -> Result<Response, Infallible> {
    // Nothing is shared between requests that a panic could leave in a broken
    // state, so continuing after one is fine.
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(response) => Ok(response),
        Err(panic) => {
            // The panic payload is `&str` or `String` for most panics.
            let msg = panic.downcast_ref::<String>()
                .map(|s| s.as_str())
                .or(panic.downcast_ref::<&str>().copied());

            match msg {
                Some(msg) => error!("INTERNAL SERVER ERROR: HTTP handler panicked: '{}'", msg),
                None => error!("INTERNAL SERVER ERROR: HTTP handler panicked"),
            }

            Ok(response::internal_server_error())
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM (Ctrl+C on Windows).
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    let signal = {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to listen for shutdown signals: {e}");
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    };

    #[cfg(not(unix))]
    let signal = {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signals: {e}");
            return std::future::pending().await;
        }
        "Ctrl+C"
    };

    info!("{signal} received, shutting down gracefully...");
}

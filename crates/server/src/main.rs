//! The manifold multiplexer server.
//!
//! Collects configuration from flags and environment variables, wires up
//! the dispatch engine and the election expiry task, and serves the
//! request handler until shutdown.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::Response,
    Router,
};
use clap::Parser;
use manifold_core::{
    config::{parse_endpoint_list, ElectionMode, ProxyConfig},
    dispatch::{DispatchEngine, InboundRequest},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "manifold",
    version,
    about = "Fan-out multiplexer between beacon clients and block builders"
)]
struct Opts {
    /// Listen address for the multiplexer server
    #[arg(long = "addr", env = "PROXY_LISTEN_ADDR", default_value = "localhost:25590")]
    listen_addr: String,

    /// Builder urls - single entry or comma-separated list (scheme://host)
    #[arg(long, env = "BUILDERS", default_value = "")]
    builders: String,

    /// Peer multiplexer urls - single entry or comma-separated list, optional
    #[arg(long, env = "PROXIES", default_value = "")]
    proxies: String,

    /// Timeout for requests to a builder [ms]
    #[arg(long = "request-timeout", env = "BUILDER_TIMEOUT_MS", default_value_t = 2000)]
    builder_timeout_ms: u64,

    /// Timeout for requests to a peer multiplexer [ms]
    #[arg(long = "proxy-timeout", env = "PROXY_TIMEOUT_MS", default_value_t = 2000)]
    proxy_timeout_ms: u64,

    /// Silence window after which the elected beacon client is forgotten [ms]
    #[arg(long = "beacon-expiry", env = "BEACON_EXPIRY_MS", default_value_t = 12_000)]
    beacon_expiry_ms: u64,

    /// Election marker source: timestamp or slot
    #[arg(long = "election-mode", env = "ELECTION_MODE", default_value = "timestamp")]
    election_mode: ElectionMode,

    /// Log level: trace, debug, info, warn, error
    #[arg(long = "loglevel", env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log in JSON format instead of text
    #[arg(long = "json", env = "LOG_JSON")]
    log_json: bool,
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(&opts.log_level, opts.log_json)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting manifold");

    let config = ProxyConfig {
        listen_addr: opts.listen_addr,
        builders: parse_endpoint_list(&opts.builders)?,
        builder_timeout: Duration::from_millis(opts.builder_timeout_ms),
        proxies: parse_endpoint_list(&opts.proxies)?,
        proxy_timeout: Duration::from_millis(opts.proxy_timeout_ms),
        beacon_expiry: Duration::from_millis(opts.beacon_expiry_ms),
        election_mode: opts.election_mode,
    };
    config.validate()?;
    info!(
        builders = config.builders.len(),
        proxies = config.proxies.len(),
        mode = %config.election_mode,
        "using configured endpoints"
    );

    let engine = Arc::new(DispatchEngine::new(&config)?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let expiry_task = engine.election().spawn_expiry_task(shutdown_tx.subscribe());

    let app = Router::new().fallback(proxy_handler).with_state(engine);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(address = %config.listen_addr, "multiplexer listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(());
    expiry_task.abort();
    info!("server shutdown complete");
    Ok(())
}

/// Routes every method and path into the dispatch engine.
async fn proxy_handler(
    State(engine): State<Arc<DispatchEngine>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(error) => {
            error!(%error, "failed to read request body");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }
    };

    let inbound = InboundRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        remote_addr,
        deadline: None,
        body,
    };
    engine.dispatch(inbound).await.map(Body::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        _ = terminate => {}
    }
}

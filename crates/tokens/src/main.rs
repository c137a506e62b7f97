//! Token issuer for builder authentication.
//!
//! Builders accept short-lived HS256 JWTs signed with a per-builder
//! shared secret. This sidecar reads a `{hostname: hexSecret}` mapping at
//! startup and, on any request to `/tokens/*`, mints one fresh token per
//! host into an `Authorization-<hostname>` response header. The caller
//! picks the header matching the builder it talks to.

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use clap::Parser;
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "manifold-tokens",
    version,
    about = "Issues short-lived builder auth tokens"
)]
struct Opts {
    /// Listen address
    #[arg(long, default_value = "localhost:1337")]
    addr: String,

    /// Path to the config file: a JSON object mapping host name to hex
    /// JWT secret
    #[arg(long, default_value = "config.json")]
    config: String,

    /// Consensus client id, optional
    #[arg(long = "client-id")]
    client_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum TokenError {
    #[error("invalid hex secret: {0}")]
    InvalidSecret(#[from] hex::FromHexError),
    #[error("failed to sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    iat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Clone)]
struct IssuerState {
    /// host name => hex-encoded HMAC secret
    secrets: Arc<HashMap<String, String>>,
    client_id: Option<String>,
}

/// Mints an HS256 JWT with an `iat` claim of the current Unix seconds
/// and the optional client id.
fn generate_token(hex_secret: &str, client_id: Option<&str>) -> Result<String, TokenError> {
    let secret = hex::decode(hex_secret)?;
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = TokenClaims {
        iat,
        id: client_id.map(str::to_owned),
    };
    Ok(jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&secret),
    )?)
}

async fn issue_tokens(
    State(state): State<IssuerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    info!(remote = %remote, "tokens requested");

    let mut response = StatusCode::OK.into_response();
    for (host, secret) in state.secrets.iter() {
        let token = match generate_token(secret, state.client_id.as_deref()) {
            Ok(token) => token,
            Err(error) => {
                error!(%error, host = %host, "failed to generate token");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to generate token for {host}: {error}\n"),
                )
                    .into_response();
            }
        };

        let name = HeaderName::from_bytes(format!("authorization-{host}").as_bytes());
        let value = HeaderValue::from_str(&format!("Bearer {token}"));
        match (name, value) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => {
                error!(host = %host, "configured host is not a valid header name");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to generate token for {host}: invalid host name\n"),
                )
                    .into_response();
            }
        }
    }
    response
}

fn router(state: IssuerState) -> Router {
    Router::new()
        .route("/tokens", any(issue_tokens))
        .route("/tokens/", any(issue_tokens))
        .route("/tokens/{*rest}", any(issue_tokens))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let raw = std::fs::read_to_string(&opts.config)
        .with_context(|| format!("failed to open config file {}", opts.config))?;
    let secrets: HashMap<String, String> =
        serde_json::from_str(&raw).with_context(|| format!("failed to read config file {}", opts.config))?;
    info!(hosts = secrets.len(), "loaded builder secrets");

    let state = IssuerState {
        secrets: Arc::new(secrets),
        client_id: opts.client_id,
    };
    let listener = tokio::net::TcpListener::bind(&opts.addr)
        .await
        .with_context(|| format!("failed to bind {}", opts.addr))?;
    info!(address = %opts.addr, "token issuer listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

//! Multiplexer configuration and endpoint-list parsing.
//!
//! The binaries collect these values from flags and environment variables;
//! this module owns the defaults, the URL-list parsing, and the startup
//! validation. Configuration is immutable once the service is constructed.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;
use url::Url;

/// Default listen address for the multiplexer server.
pub const DEFAULT_LISTEN_ADDR: &str = "localhost:25590";

/// Default timeout for requests to a builder, in milliseconds.
pub const DEFAULT_BUILDER_TIMEOUT_MS: u64 = 2000;

/// Default timeout for requests to a peer multiplexer, in milliseconds.
pub const DEFAULT_PROXY_TIMEOUT_MS: u64 = 2000;

/// Default silence window after which the elected beacon client is
/// forgotten, in milliseconds. One mainnet slot.
pub const DEFAULT_BEACON_EXPIRY_MS: u64 = 12_000;

/// Configuration errors detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no builders specified")]
    NoBuilders,
    #[error("invalid endpoint URL {entry:?}: {source}")]
    InvalidUrl {
        entry: String,
        source: url::ParseError,
    },
}

/// Which request field drives the upstream election.
///
/// The two modes are mutually exclusive; a deployment picks one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionMode {
    /// Follow the highest `timestamp` seen in `engine_newPayload*` and
    /// `engine_forkchoiceUpdated*` requests.
    #[default]
    Timestamp,
    /// Follow the highest `slot` seen in `builder_payloadAttributes`
    /// requests.
    Slot,
}

impl fmt::Display for ElectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp => write!(f, "timestamp"),
            Self::Slot => write!(f, "slot"),
        }
    }
}

impl FromStr for ElectionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "timestamp" => Ok(Self::Timestamp),
            "slot" => Ok(Self::Slot),
            other => Err(format!(
                "invalid election mode {other:?}, expected \"timestamp\" or \"slot\""
            )),
        }
    }
}

/// Immutable service configuration, assembled by the server binary.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address for the multiplexer HTTP server.
    pub listen_addr: String,
    /// Builder endpoints; the first entry is the primary.
    pub builders: Vec<Url>,
    /// Dial timeout for builder requests.
    pub builder_timeout: Duration,
    /// Peer multiplexers that receive mirrored requests, optional.
    pub proxies: Vec<Url>,
    /// Dial timeout for peer requests.
    pub proxy_timeout: Duration,
    /// Silence window after which the elected beacon client is forgotten.
    pub beacon_expiry: Duration,
    /// Which request field drives the upstream election.
    pub election_mode: ElectionMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            builders: Vec::new(),
            builder_timeout: Duration::from_millis(DEFAULT_BUILDER_TIMEOUT_MS),
            proxies: Vec::new(),
            proxy_timeout: Duration::from_millis(DEFAULT_PROXY_TIMEOUT_MS),
            beacon_expiry: Duration::from_millis(DEFAULT_BEACON_EXPIRY_MS),
            election_mode: ElectionMode::Timestamp,
        }
    }
}

impl ProxyConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoBuilders`] when the builder list is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.builders.is_empty() {
            return Err(ConfigError::NoBuilders);
        }
        Ok(())
    }
}

/// Parses a comma-separated endpoint list.
///
/// Entries are trimmed, empty entries are skipped, and entries without a
/// scheme get `http://` prepended.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidUrl`] for an entry that does not parse
/// as an absolute URL.
pub fn parse_endpoint_list(list: &str) -> Result<Vec<Url>, ConfigError> {
    let mut endpoints = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let with_scheme = if entry.starts_with("http") {
            entry.to_owned()
        } else {
            format!("http://{entry}")
        };
        let url = Url::parse(&with_scheme).map_err(|source| ConfigError::InvalidUrl {
            entry: entry.to_owned(),
            source,
        })?;
        endpoints.push(url);
    }
    Ok(endpoints)
}

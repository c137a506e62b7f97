//! Outbound endpoints and the immutable registry built at startup.
//!
//! Every configured builder and peer gets its own pooled HTTP client,
//! tuned once at construction and reused for the process lifetime.

use reqwest::{redirect, Client};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use url::Url;

/// Maximum idle connections kept per endpoint host.
const MAX_IDLE_CONNECTIONS: usize = 100;

/// How long an idle pooled connection is kept around.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// Errors constructing the endpoint registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no builders specified")]
    NoBuilders,
    #[error("failed to build HTTP client for {url}: {source}")]
    ClientBuild { url: Url, source: reqwest::Error },
}

/// A single outbound endpoint: its base URL and a preconfigured client.
///
/// The client never follows redirects so responses can be inspected and
/// replayed raw.
#[derive(Debug)]
pub struct ProxyEndpoint {
    url: Url,
    client: Client,
}

impl ProxyEndpoint {
    /// Builds an endpoint whose client dials with the given timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ClientBuild`] if the underlying client
    /// fails to build.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .tcp_keepalive(timeout)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_CONNECTION_TIMEOUT)
            .redirect(redirect::Policy::none())
            .use_rustls_tls()
            .build()
            .map_err(|source| RegistryError::ClientBuild {
                url: url.clone(),
                source,
            })?;
        Ok(Self { url, client })
    }

    /// The configured base URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The endpoint's pooled HTTP client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// The immutable set of builders and peer multiplexers.
#[derive(Debug)]
pub struct EndpointRegistry {
    builders: Vec<Arc<ProxyEndpoint>>,
    proxies: Vec<Arc<ProxyEndpoint>>,
}

impl EndpointRegistry {
    /// Builds one endpoint per configured URL.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoBuilders`] when `builders` is empty,
    /// or [`RegistryError::ClientBuild`] when a client fails to build.
    pub fn new(
        builders: &[Url],
        builder_timeout: Duration,
        proxies: &[Url],
        proxy_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        if builders.is_empty() {
            return Err(RegistryError::NoBuilders);
        }

        let builders = builders
            .iter()
            .map(|url| ProxyEndpoint::new(url.clone(), builder_timeout).map(Arc::new))
            .collect::<Result<_, _>>()?;
        let proxies = proxies
            .iter()
            .map(|url| ProxyEndpoint::new(url.clone(), proxy_timeout).map(Arc::new))
            .collect::<Result<_, _>>()?;

        Ok(Self { builders, proxies })
    }

    /// The configured builders, in priority order. Index 0 is primary.
    #[must_use]
    pub fn builders(&self) -> &[Arc<ProxyEndpoint>] {
        &self.builders
    }

    /// The configured peer multiplexers.
    #[must_use]
    pub fn proxies(&self) -> &[Arc<ProxyEndpoint>] {
        &self.proxies
    }
}

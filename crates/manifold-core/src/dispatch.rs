//! The request dispatcher: filter, fan out, select, relay.
//!
//! Control flow per inbound request:
//!
//! ```text
//! read body ─► parse envelope ─► update election ─► filter
//!                                                     │ accepted
//!                    ┌────────────────────────────────┤
//!                    ▼                                ▼
//!            peer fan-out (no wait)        builder fan-out (wait all)
//!                                                     │
//!                                          select primary response
//!                                                     │
//!                                          divergence log ─► relay
//! ```
//!
//! The dispatcher is an opaque relay: it never synthesizes JSON-RPC error
//! envelopes, never retries, and never second-guesses the primary builder.
//! Filtered requests get a silent 200 so a redundant beacon client does
//! not treat rejection as an actionable error and flap.

use crate::{
    config::{ElectionMode, ProxyConfig},
    election::BeaconElection,
    endpoint::{EndpointRegistry, ProxyEndpoint, RegistryError},
    proxy::{copy_headers, decompress_gzip, remote_host, send_proxy_request},
    types::{
        extract_status, is_engine_method, is_new_payload_method, RpcRequest,
        BUILDER_ATTRIBUTES_METHOD,
    },
};
use bytes::Bytes;
use futures_util::{stream::FuturesUnordered, StreamExt};
use http::{header, HeaderMap, Method, Response, StatusCode, Uri};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

/// Errors surfaced to the caller as an HTTP error status.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no successful builder response")]
    NoSuccessfulBuilderResponse,
}

/// A captured inbound request, body already buffered.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
    /// Deadline the caller attached to the request, if any. Checked once
    /// before fan-out; in-flight dispatches are never canceled.
    pub deadline: Option<Instant>,
    pub body: Bytes,
}

impl InboundRequest {
    /// The inbound host, used for `X-Forwarded-For`.
    #[must_use]
    pub fn host(&self) -> &str {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri.host())
            .unwrap_or("")
    }

    /// The normalized address the request was observed from.
    #[must_use]
    pub fn remote_host(&self) -> String {
        remote_host(&self.headers, self.remote_addr)
    }
}

/// One builder's answer to a fanned-out request.
#[derive(Debug, Clone)]
pub struct BuilderResponse {
    pub headers: HeaderMap,
    /// The raw body, relayed verbatim to the client.
    pub body: Bytes,
    /// A decompressed copy, present only when the response was gzipped.
    /// Used for comparison, never relayed.
    pub uncompressed_body: Option<Bytes>,
    pub url: Url,
    pub status: StatusCode,
}

impl BuilderResponse {
    /// The body to inspect: the decompressed copy when present, else the
    /// raw bytes.
    #[must_use]
    pub fn comparison_body(&self) -> &[u8] {
        self.uncompressed_body.as_deref().unwrap_or(&self.body)
    }
}

/// The HTTP request handler shared by all connections.
///
/// Owns the endpoint registry and the election; the election record is
/// the only mutable state coupling requests.
#[derive(Debug)]
pub struct DispatchEngine {
    registry: EndpointRegistry,
    election: Arc<BeaconElection>,
    mode: ElectionMode,
}

impl DispatchEngine {
    /// Builds the engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoBuilders`] when no builders are
    /// configured.
    pub fn new(config: &ProxyConfig) -> Result<Self, RegistryError> {
        let registry = EndpointRegistry::new(
            &config.builders,
            config.builder_timeout,
            &config.proxies,
            config.proxy_timeout,
        )?;
        let election = Arc::new(BeaconElection::new(
            config.election_mode,
            config.beacon_expiry,
        ));
        Ok(Self {
            registry,
            election,
            mode: config.election_mode,
        })
    }

    /// The shared election state, for spawning the expiry task.
    #[must_use]
    pub fn election(&self) -> &Arc<BeaconElection> {
        &self.election
    }

    /// Handles one inbound request end to end.
    pub async fn dispatch(&self, inbound: InboundRequest) -> Response<Bytes> {
        // GET is the health probe.
        if inbound.method == Method::GET {
            return empty_response(StatusCode::OK);
        }

        let request = match RpcRequest::decode(&inbound.body) {
            Ok(request) => request,
            Err(error) => {
                error!(%error, "failed to decode request body");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let remote = inbound.remote_host();
        debug!(
            method = %request.method,
            id = request.id,
            remote = %remote,
            "request received from beacon client"
        );

        // Election updates precede filtering so slot-mode attribute
        // requests can drive the election.
        self.election.observe(&request, &remote);

        if self.should_filter(&remote, &request.method) {
            debug!(
                remote = %remote,
                method = %request.method,
                "filtered request from beacon client the proxy is not synced to"
            );
            return empty_response(StatusCode::OK);
        }

        if inbound.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return empty_response(StatusCode::BAD_REQUEST);
        }

        let inbound = Arc::new(inbound);
        self.call_proxies(&inbound);

        match self.call_builders(&inbound, &request).await {
            Ok(primary) => {
                let mut response = Response::new(primary.body.clone());
                *response.status_mut() = primary.status;
                copy_headers(response.headers_mut(), &primary.headers);
                response
            }
            Err(error) => {
                let mut response = Response::new(Bytes::from(format!("{error}\n")));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }

    /// Whether a request is dropped before any fan-out.
    ///
    /// `engine_newPayload*` is exempt from the election check because
    /// payload validation is idempotent and safe to mirror from every
    /// beacon; forkchoice and attributes must come from a single source
    /// to avoid oscillation.
    fn should_filter(&self, remote: &str, method: &str) -> bool {
        let accepted = is_engine_method(method)
            || (self.mode == ElectionMode::Slot && method == BUILDER_ATTRIBUTES_METHOD);
        if !accepted {
            return true;
        }
        !is_new_payload_method(method) && !self.election.is_elected(remote)
    }

    /// Fans the captured request out to every builder and waits for all
    /// of them.
    ///
    /// The primary is the first configured builder's response whenever it
    /// arrived, else the earliest-completing one. Individual failures are
    /// logged and never abort the fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoSuccessfulBuilderResponse`] when no
    /// builder completed a round-trip.
    async fn call_builders(
        &self,
        inbound: &Arc<InboundRequest>,
        request: &RpcRequest,
    ) -> Result<BuilderResponse, DispatchError> {
        let mut in_flight: FuturesUnordered<_> = self
            .registry
            .builders()
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                let endpoint = Arc::clone(endpoint);
                let inbound = Arc::clone(inbound);
                async move {
                    let body = inbound.body.clone();
                    let result = send_proxy_request(&endpoint, &inbound, body).await;
                    (index, endpoint, result)
                }
            })
            .collect();

        let mut successes = 0usize;
        let mut primary: Option<BuilderResponse> = None;
        let mut responses = Vec::with_capacity(self.registry.builders().len());

        while let Some((index, endpoint, result)) = in_flight.next().await {
            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    error!(url = %endpoint.url(), %error, "error sending request to builder");
                    continue;
                }
            };

            let status = response.status();
            let headers = response.headers().clone();
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(error) => {
                    error!(url = %endpoint.url(), %error, "failed to read builder response body");
                    continue;
                }
            };

            let uncompressed_body = if is_gzip(&headers) {
                match decompress_gzip(&body) {
                    Ok(decompressed) => Some(decompressed),
                    Err(error) => {
                        error!(
                            url = %endpoint.url(),
                            %error,
                            "failed to decompress builder response body"
                        );
                        None
                    }
                }
            } else {
                None
            };

            let builder_response = BuilderResponse {
                headers,
                body,
                uncompressed_body,
                url: endpoint.url().clone(),
                status,
            };
            debug!(
                method = %request.method,
                id = request.id,
                url = %endpoint.url(),
                response = %String::from_utf8_lossy(builder_response.comparison_body()),
                "response received from builder"
            );

            // The earliest completion is the fallback primary; the first
            // configured builder overrides it whenever it answered.
            if successes == 0 || index == 0 {
                primary = Some(builder_response.clone());
            }
            successes += 1;
            responses.push(builder_response);
        }

        let Some(primary) = primary else {
            return Err(DispatchError::NoSuccessfulBuilderResponse);
        };

        if is_engine_method(&request.method) {
            log_response_differences(&request.method, &primary, &responses);
        }

        Ok(primary)
    }

    /// Mirrors the captured request to every peer multiplexer,
    /// fire-and-forget. Never joined from the request path.
    fn call_proxies(&self, inbound: &Arc<InboundRequest>) {
        for endpoint in self.registry.proxies() {
            let endpoint = Arc::clone(endpoint);
            let inbound = Arc::clone(inbound);
            tokio::spawn(async move {
                let body = inbound.body.clone();
                if let Err(error) = send_proxy_request(&endpoint, &inbound, body).await {
                    error!(url = %endpoint.url(), %error, "error sending request to peer proxy");
                }
            });
        }
    }
}

/// Compares probed statuses against the primary's and logs divergences.
/// Extraction failures are logged and never affect the relayed response.
fn log_response_differences(
    method: &str,
    primary: &BuilderResponse,
    responses: &[BuilderResponse],
) {
    let expected = match extract_status(method, primary.comparison_body()) {
        Ok(status) => status,
        Err(error) => {
            error!(
                %error,
                method = %method,
                url = %primary.url,
                "error reading status from primary execution response"
            );
            None
        }
    };
    let Some(expected) = expected else {
        return;
    };

    for response in responses {
        if response.url == primary.url {
            continue;
        }
        let status = match extract_status(method, response.comparison_body()) {
            Ok(status) => status,
            Err(error) => {
                error!(
                    %error,
                    method = %method,
                    url = %response.url,
                    "error reading status from execution response"
                );
                None
            }
        };
        let status = status.unwrap_or_default();
        if status != expected {
            info!(
                primary_status = %expected,
                secondary_status = %status,
                primary_url = %primary.url,
                secondary_url = %response.url,
                "found difference in execution client responses"
            );
        }
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"))
}

fn empty_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

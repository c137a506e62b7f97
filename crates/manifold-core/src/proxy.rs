//! Body-preserving request rewriting for the outbound fan-out.
//!
//! The dispatcher multiplexes one inbound body to N outbound requests and
//! inspects every response before forwarding, so it drives the endpoint
//! clients directly instead of a full reverse-proxy layer. The two
//! primitives here are [`build_proxy_request`] (rewrite the inbound
//! request against a target endpoint) and [`send_proxy_request`] (issue it
//! and hand back the raw response).

use crate::{dispatch::InboundRequest, endpoint::ProxyEndpoint};
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::{header, HeaderMap, HeaderName, HeaderValue};
use std::{io::Read, net::SocketAddr};

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Clones the inbound request against a target endpoint.
///
/// The method, path, and query are preserved, the scheme and host are
/// rewritten to the endpoint, the inbound host is appended to
/// `X-Forwarded-For`, and the body is replaced with the captured bytes.
///
/// # Errors
///
/// Returns an error if the outbound request cannot be constructed.
pub fn build_proxy_request(
    endpoint: &ProxyEndpoint,
    inbound: &InboundRequest,
    body: Bytes,
) -> reqwest::Result<reqwest::Request> {
    let mut target = endpoint.url().clone();
    target.set_path(&join_paths(target.path(), inbound.uri.path()));
    target.set_query(inbound.uri.query());

    let mut headers = inbound.headers.clone();
    // The client fills these in for the rewritten target.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    append_forwarded_host(&mut headers, inbound.host());

    endpoint
        .client()
        .request(inbound.method.clone(), target)
        .headers(headers)
        .body(body)
        .build()
}

/// Builds and issues the rewritten request on the endpoint's client,
/// returning the raw response for inspection and replay.
///
/// # Errors
///
/// Returns the transport error when the round-trip fails.
pub async fn send_proxy_request(
    endpoint: &ProxyEndpoint,
    inbound: &InboundRequest,
    body: Bytes,
) -> reqwest::Result<reqwest::Response> {
    let request = build_proxy_request(endpoint, inbound, body)?;
    endpoint.client().execute(request).await
}

/// Appends a host to `X-Forwarded-For`, joining any prior values with
/// commas.
pub fn append_forwarded_host(headers: &mut HeaderMap, host: &str) {
    if host.is_empty() {
        return;
    }
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let joined = if prior.is_empty() {
        host.to_owned()
    } else {
        format!("{}, {host}", prior.join(", "))
    };
    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.insert(&X_FORWARDED_FOR, value);
    }
}

/// Normalizes the address a request was observed from: the leftmost
/// `X-Forwarded-For` value when present, else the peer IP.
#[must_use]
pub fn remote_host(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers
        .get(&X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    peer.ip().to_string()
}

/// Copies every header from `src` into `dst`, preserving repeated values.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

/// Decompresses a gzip response body.
///
/// # Errors
///
/// Returns the underlying I/O error when the bytes are not valid gzip.
pub fn decompress_gzip(body: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(body);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(Bytes::from(decompressed))
}

fn join_paths(base: &str, inbound: &str) -> String {
    let base = base.trim_end_matches('/');
    if inbound.is_empty() || inbound == "/" {
        if base.is_empty() {
            "/".to_owned()
        } else {
            base.to_owned()
        }
    } else {
        format!("{base}{inbound}")
    }
}

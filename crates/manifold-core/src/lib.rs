//! # Manifold Core
//!
//! Core library for the manifold engine-API fan-out multiplexer.
//!
//! A single staking operator runs several redundant beacon clients for
//! safety, but only one of them should drive the block builders at any
//! moment. The multiplexer sits between them: it elects one "best"
//! upstream beacon, forwards its engine-API requests to every configured
//! builder concurrently, returns a single canonical response, and
//! optionally mirrors the traffic to peer multiplexers.
//!
//! - **[`types`]**: JSON-RPC envelope and the method-conditional codec —
//!   typed params for the methods the dispatcher inspects, opaque values
//!   for everything else.
//!
//! - **[`config`]**: service configuration, endpoint-list parsing, and
//!   startup validation.
//!
//! - **[`endpoint`]**: the immutable registry of builders and peers, one
//!   tuned HTTP client per endpoint.
//!
//! - **[`election`]**: the best-beacon record with its marker
//!   monotonicity rules and the silence-expiry timer.
//!
//! - **[`dispatch`]**: the HTTP handler — body capture, filtering,
//!   parallel builder fan-out, fire-and-forget peer fan-out, primary
//!   selection, and divergence logging.
//!
//! - **[`proxy`]**: body-preserving request rewriting, forwarded-header
//!   bookkeeping, and response decompression helpers.

pub mod config;
pub mod dispatch;
pub mod election;
pub mod endpoint;
pub mod proxy;
pub mod types;

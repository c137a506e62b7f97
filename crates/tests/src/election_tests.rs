//! Election behavior driven through the dispatcher.

use crate::{fixtures, mock_builder::MockBuilder};
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use manifold_core::{
    config::{parse_endpoint_list, ElectionMode, ProxyConfig},
    dispatch::{DispatchEngine, InboundRequest},
};
use std::time::Duration;
use tokio::sync::broadcast;

const BEACON_A: &str = "10.0.0.0:1234";
const BEACON_B: &str = "10.0.0.1:1234";

fn engine_with(
    builder: &MockBuilder,
    election_mode: ElectionMode,
    beacon_expiry: Duration,
) -> DispatchEngine {
    let config = ProxyConfig {
        builders: parse_endpoint_list(&builder.url()).unwrap(),
        builder_timeout: Duration::from_secs(1),
        beacon_expiry,
        election_mode,
        ..ProxyConfig::default()
    };
    DispatchEngine::new(&config).unwrap()
}

async fn post(engine: &DispatchEngine, body: &str, remote: &str) {
    let inbound = InboundRequest {
        method: Method::POST,
        uri: Uri::from_static("/"),
        headers: HeaderMap::new(),
        remote_addr: remote.parse().unwrap(),
        deadline: None,
        body: Bytes::from(body.to_owned()),
    };
    engine.dispatch(inbound).await;
}

#[tokio::test]
async fn election_follows_the_highest_timestamp() {
    let builder = MockBuilder::start(fixtures::FORKCHOICE_RESPONSE).await;
    let engine = engine_with(&builder, ElectionMode::Timestamp, Duration::from_secs(12));

    post(&engine, &fixtures::forkchoice_request_with_timestamp(1), BEACON_A).await;
    let best = engine.election().current().unwrap();
    assert_eq!((best.remote.as_str(), best.marker), ("10.0.0.0", 1));

    post(&engine, &fixtures::forkchoice_request_with_timestamp(10), BEACON_A).await;
    let best = engine.election().current().unwrap();
    assert_eq!((best.remote.as_str(), best.marker), ("10.0.0.0", 10));

    // An equal marker from another beacon does not switch the election,
    // even though the request itself is filtered.
    post(&engine, &fixtures::forkchoice_request_with_timestamp(10), BEACON_B).await;
    let best = engine.election().current().unwrap();
    assert_eq!((best.remote.as_str(), best.marker), ("10.0.0.0", 10));

    // A strictly greater one does.
    post(&engine, &fixtures::forkchoice_request_with_timestamp(11), BEACON_B).await;
    let best = engine.election().current().unwrap();
    assert_eq!((best.remote.as_str(), best.marker), ("10.0.0.1", 11));
}

#[tokio::test]
async fn takeover_beacon_steers_forkchoice_afterwards() {
    let builder = MockBuilder::start(fixtures::FORKCHOICE_RESPONSE).await;
    let engine = engine_with(&builder, ElectionMode::Timestamp, Duration::from_secs(12));

    post(&engine, &fixtures::forkchoice_request_with_timestamp(1), BEACON_A).await;
    assert_eq!(builder.request_count("engine_forkchoiceUpdatedV1"), 1);

    // The takeover request itself already passes the filter: the election
    // is updated before the filter decision.
    post(&engine, &fixtures::forkchoice_request_with_timestamp(2), BEACON_B).await;
    assert_eq!(builder.request_count("engine_forkchoiceUpdatedV1"), 2);

    // The displaced beacon is filtered from then on.
    post(&engine, &fixtures::forkchoice_request_with_timestamp(2), BEACON_A).await;
    assert_eq!(builder.request_count("engine_forkchoiceUpdatedV1"), 2);
}

#[tokio::test]
async fn election_expires_after_silence() {
    let builder = MockBuilder::start(fixtures::NEW_PAYLOAD_RESPONSE_VALID).await;
    let engine = engine_with(&builder, ElectionMode::Timestamp, Duration::from_secs(1));

    let (shutdown_tx, _) = broadcast::channel(1);
    let expiry_task = engine.election().spawn_expiry_task(shutdown_tx.subscribe());

    post(&engine, fixtures::NEW_PAYLOAD_REQUEST, BEACON_A).await;
    assert!(engine.election().is_elected("10.0.0.0"));

    tokio::time::sleep(Duration::from_millis(500)).await;

    // A request from a beacon that is not eligible to elect neither
    // rearms nor clears the record.
    post(&engine, fixtures::ETH_CHAIN_ID_REQUEST, BEACON_B).await;
    assert!(engine.election().is_elected("10.0.0.0"));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(engine.election().current(), None);

    drop(shutdown_tx);
    expiry_task.abort();
}

#[tokio::test]
async fn slot_mode_election_follows_the_highest_slot() {
    let builder = MockBuilder::start(fixtures::NEW_PAYLOAD_RESPONSE_VALID).await;
    let engine = engine_with(&builder, ElectionMode::Slot, Duration::from_secs(12));

    post(&engine, &fixtures::payload_attributes_request_with_slot(5), BEACON_A).await;
    let best = engine.election().current().unwrap();
    assert_eq!((best.remote.as_str(), best.marker), ("10.0.0.0", 5));
    assert_eq!(builder.request_count("builder_payloadAttributes"), 1);

    // A lower slot from another beacon is observed but filtered.
    post(&engine, &fixtures::payload_attributes_request_with_slot(4), BEACON_B).await;
    assert!(engine.election().is_elected("10.0.0.0"));
    assert_eq!(builder.request_count("builder_payloadAttributes"), 1);

    post(&engine, &fixtures::payload_attributes_request_with_slot(6), BEACON_B).await;
    assert!(engine.election().is_elected("10.0.0.1"));
    assert_eq!(builder.request_count("builder_payloadAttributes"), 2);
}

//! End-to-end scenarios through the dispatch engine.

use crate::{fixtures, mock_builder::MockBuilder};
use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use manifold_core::{
    config::{parse_endpoint_list, ElectionMode, ProxyConfig},
    dispatch::{DispatchEngine, InboundRequest},
};
use std::time::{Duration, Instant};

const BEACON_A: &str = "10.0.0.0:1234";
const BEACON_B: &str = "10.0.0.1:1234";

struct TestBackend {
    engine: DispatchEngine,
    builders: Vec<MockBuilder>,
    proxies: Vec<MockBuilder>,
}

impl TestBackend {
    async fn new(num_builders: usize) -> Self {
        Self::with_options(num_builders, 0, ElectionMode::Timestamp).await
    }

    async fn with_options(
        num_builders: usize,
        num_proxies: usize,
        election_mode: ElectionMode,
    ) -> Self {
        let mut builders = Vec::with_capacity(num_builders);
        for _ in 0..num_builders {
            builders.push(MockBuilder::start(fixtures::NEW_PAYLOAD_RESPONSE_VALID).await);
        }
        let mut proxies = Vec::with_capacity(num_proxies);
        for _ in 0..num_proxies {
            proxies.push(MockBuilder::start(fixtures::NEW_PAYLOAD_RESPONSE_VALID).await);
        }

        let config = ProxyConfig {
            builders: parse_endpoint_list(&urls(&builders)).unwrap(),
            proxies: parse_endpoint_list(&urls(&proxies)).unwrap(),
            builder_timeout: Duration::from_secs(1),
            proxy_timeout: Duration::from_secs(1),
            election_mode,
            ..ProxyConfig::default()
        };
        let engine = DispatchEngine::new(&config).unwrap();
        Self { engine, builders, proxies }
    }

    async fn post(&self, body: &str, remote: &str) -> Response<Bytes> {
        self.engine.dispatch(inbound(Method::POST, body, remote, None)).await
    }
}

fn urls(builders: &[MockBuilder]) -> String {
    builders
        .iter()
        .map(MockBuilder::url)
        .collect::<Vec<_>>()
        .join(",")
}

fn inbound(method: Method, body: &str, remote: &str, deadline: Option<Instant>) -> InboundRequest {
    InboundRequest {
        method,
        uri: Uri::from_static("/"),
        headers: HeaderMap::new(),
        remote_addr: remote.parse().unwrap(),
        deadline,
        body: Bytes::from(body.to_owned()),
    }
}

async fn wait_for_count(builder: &MockBuilder, method: &str, expected: usize) {
    for _ in 0..100 {
        if builder.request_count(method) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(builder.request_count(method), expected);
}

#[tokio::test]
async fn new_payload_reaches_every_builder() {
    let backend = TestBackend::new(2).await;

    let response = backend.post(fixtures::NEW_PAYLOAD_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.body().as_ref(),
        fixtures::NEW_PAYLOAD_RESPONSE_VALID.as_bytes()
    );
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 1);
    assert_eq!(backend.builders[1].request_count("engine_newPayloadV1"), 1);

    // The body is replayed to every builder byte for byte.
    for builder in &backend.builders {
        assert_eq!(
            builder.last_body().unwrap().as_ref(),
            fixtures::NEW_PAYLOAD_REQUEST.as_bytes()
        );
    }
}

#[tokio::test]
async fn forkchoice_from_the_elected_beacon_is_relayed() {
    let backend = TestBackend::new(2).await;
    backend.builders[0].set_response(fixtures::FORKCHOICE_RESPONSE);
    backend.builders[1].set_response(fixtures::FORKCHOICE_RESPONSE);

    let response = backend.post(fixtures::FORKCHOICE_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), fixtures::FORKCHOICE_RESPONSE.as_bytes());
    assert_eq!(backend.builders[0].request_count("engine_forkchoiceUpdatedV1"), 1);
    assert_eq!(backend.builders[1].request_count("engine_forkchoiceUpdatedV1"), 1);
}

#[tokio::test]
async fn other_engine_methods_are_forwarded_opaque() {
    let backend = TestBackend::new(2).await;
    backend.builders[0].set_response(fixtures::TRANSITION_CONFIG_RESPONSE);
    backend.builders[1].set_response(fixtures::TRANSITION_CONFIG_RESPONSE);

    let response = backend.post(fixtures::TRANSITION_CONFIG_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.body().as_ref(),
        fixtures::TRANSITION_CONFIG_RESPONSE.as_bytes()
    );
    let method = "engine_exchangeTransitionConfigurationV1";
    assert_eq!(backend.builders[0].request_count(method), 1);
    assert_eq!(backend.builders[1].request_count(method), 1);
}

#[tokio::test]
async fn non_engine_requests_are_silently_filtered() {
    let backend = TestBackend::new(2).await;

    let response = backend.post(fixtures::ETH_CHAIN_ID_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.body().is_empty());
    assert_eq!(backend.builders[0].request_count("eth_chainId"), 0);
    assert_eq!(backend.builders[1].request_count("eth_chainId"), 0);
}

#[tokio::test]
async fn divergent_responses_relay_the_first_configured_builder() {
    let backend = TestBackend::new(2).await;
    backend.builders[0].set_response(fixtures::NEW_PAYLOAD_RESPONSE_SYNCING);
    backend.builders[1].set_response(fixtures::NEW_PAYLOAD_RESPONSE_VALID);

    let response = backend.post(fixtures::NEW_PAYLOAD_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.body().as_ref(),
        fixtures::NEW_PAYLOAD_RESPONSE_SYNCING.as_bytes()
    );
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 1);
    assert_eq!(backend.builders[1].request_count("engine_newPayloadV1"), 1);
}

#[tokio::test]
async fn slow_primary_still_wins_selection() {
    let backend = TestBackend::new(2).await;
    backend.builders[0].set_response(fixtures::NEW_PAYLOAD_RESPONSE_SYNCING);
    backend.builders[0].set_response_delay(Duration::from_millis(100));
    backend.builders[1].set_response(fixtures::NEW_PAYLOAD_RESPONSE_VALID);

    let response = backend.post(fixtures::NEW_PAYLOAD_REQUEST, BEACON_A).await;

    assert_eq!(
        response.body().as_ref(),
        fixtures::NEW_PAYLOAD_RESPONSE_SYNCING.as_bytes()
    );
}

#[tokio::test]
async fn offline_primary_falls_back_to_another_builder() {
    let mut backend = TestBackend::new(2).await;
    backend.builders[1].set_response(fixtures::NEW_PAYLOAD_RESPONSE_SYNCING);
    backend.builders[0].close().await;

    let response = backend.post(fixtures::NEW_PAYLOAD_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.body().as_ref(),
        fixtures::NEW_PAYLOAD_RESPONSE_SYNCING.as_bytes()
    );
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 0);
    assert_eq!(backend.builders[1].request_count("engine_newPayloadV1"), 1);
}

#[tokio::test]
async fn offline_secondary_does_not_affect_the_primary() {
    let mut backend = TestBackend::new(2).await;
    backend.builders[0].set_response(fixtures::FORKCHOICE_RESPONSE);
    backend.builders[1].close().await;

    let response = backend.post(fixtures::FORKCHOICE_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), fixtures::FORKCHOICE_RESPONSE.as_bytes());
    assert_eq!(backend.builders[0].request_count("engine_forkchoiceUpdatedV1"), 1);
    assert_eq!(backend.builders[1].request_count("engine_forkchoiceUpdatedV1"), 0);
}

#[tokio::test]
async fn all_builders_offline_is_a_bad_gateway() {
    let mut backend = TestBackend::new(1).await;
    backend.builders[0].close().await;

    let response = backend.post(fixtures::NEW_PAYLOAD_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.body().as_ref(), b"no successful builder response\n");
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 0);
}

#[tokio::test]
async fn unelected_beacons_cannot_steer_forkchoice() {
    let backend = TestBackend::new(1).await;
    backend.builders[0].set_response(fixtures::FORKCHOICE_RESPONSE);

    // The first request elects its sender.
    let response = backend.post(fixtures::FORKCHOICE_REQUEST, BEACON_A).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.builders[0].request_count("engine_forkchoiceUpdatedV1"), 1);

    // Forkchoice from anyone else is silently dropped.
    let response = backend.post(fixtures::FORKCHOICE_REQUEST, BEACON_B).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.body().is_empty());
    assert_eq!(backend.builders[0].request_count("engine_forkchoiceUpdatedV1"), 1);

    // Payload validation is idempotent, so newPayload is mirrored from
    // every beacon.
    let response = backend.post(fixtures::NEW_PAYLOAD_REQUEST, BEACON_B).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 1);
}

#[tokio::test]
async fn peers_receive_mirrored_requests() {
    let backend = TestBackend::with_options(1, 1, ElectionMode::Timestamp).await;

    let response = backend.post(fixtures::NEW_PAYLOAD_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 1);
    wait_for_count(&backend.proxies[0], "engine_newPayloadV1", 1).await;
}

#[tokio::test]
async fn filtered_requests_reach_no_peers() {
    let backend = TestBackend::with_options(1, 1, ElectionMode::Timestamp).await;

    let response = backend.post(fixtures::ETH_CHAIN_ID_REQUEST, BEACON_A).await;
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.builders[0].request_count("eth_chainId"), 0);
    assert_eq!(backend.proxies[0].request_count("eth_chainId"), 0);
}

#[tokio::test]
async fn expired_deadline_is_rejected_before_fan_out() {
    let backend = TestBackend::new(1).await;

    let request = inbound(
        Method::POST,
        fixtures::NEW_PAYLOAD_REQUEST,
        BEACON_A,
        Some(Instant::now() - Duration::from_millis(1)),
    );
    let response = backend.engine.dispatch(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 0);
}

#[tokio::test]
async fn get_is_a_health_probe() {
    let backend = TestBackend::new(1).await;

    let request = inbound(Method::GET, "", BEACON_A, None);
    let response = backend.engine.dispatch(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.body().is_empty());
}

#[tokio::test]
async fn malformed_body_is_a_server_error() {
    let backend = TestBackend::new(1).await;

    let response = backend.post("not json", BEACON_A).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.builders[0].request_count("engine_newPayloadV1"), 0);
}

#[tokio::test]
async fn missing_new_payload_params_are_a_server_error() {
    let backend = TestBackend::new(1).await;

    let body = r#"{"jsonrpc":"2.0","method":"engine_newPayloadV1","params":[],"id":1}"#;
    let response = backend.post(body, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn slot_mode_forwards_builder_attributes() {
    let backend = TestBackend::with_options(1, 0, ElectionMode::Slot).await;

    let response = backend.post(fixtures::PAYLOAD_ATTRIBUTES_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.builders[0].request_count("builder_payloadAttributes"), 1);
}

#[tokio::test]
async fn timestamp_mode_filters_builder_attributes() {
    let backend = TestBackend::new(1).await;

    let response = backend.post(fixtures::PAYLOAD_ATTRIBUTES_REQUEST, BEACON_A).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.body().is_empty());
    assert_eq!(backend.builders[0].request_count("builder_payloadAttributes"), 0);
}

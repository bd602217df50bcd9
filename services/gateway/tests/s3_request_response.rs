//! S3 -- REQUEST/RESPONSE correlation by requestId.

mod common;

use gateway_test_utils::MockGatewayClient;
use protocol::ServerEnvelope;

#[tokio::test]
async fn request_reply_carries_the_same_request_id() {
    let (_pool, addr, _state) = common::start_server().await;
    let mut client = MockGatewayClient::connect(&common::ws_url(addr))
        .await
        .expect("connect");
    let _ = client.recv_envelope().await.expect("connect ack");

    client
        .send_json(&serde_json::json!({
            "type": "REQUEST",
            "topic": "market-data",
            "action": "getToken",
            "requestId": "abc",
            "data": {"symbol": "BTC"},
        }))
        .await
        .expect("send request");

    match client.recv_envelope().await.expect("request reply") {
        ServerEnvelope::Data {
            topic,
            action,
            request_id,
            data,
            ..
        } => {
            assert_eq!(topic, "market-data");
            assert_eq!(action, Some("getToken".to_owned()));
            assert_eq!(request_id, Some("abc".to_owned()));
            assert_eq!(data, serde_json::json!({"symbol": "BTC"}));
        }
        other => panic!("expected DATA reply, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_topic_request_is_rejected_with_not_found() {
    let (_pool, addr, _state) = common::start_server().await;
    let mut client = MockGatewayClient::connect(&common::ws_url(addr))
        .await
        .expect("connect");
    let _ = client.recv_envelope().await.expect("connect ack");

    client
        .send_json(&serde_json::json!({
            "type": "REQUEST",
            "topic": "not-a-real-topic",
            "action": "whatever",
            "requestId": "r1",
            "data": {},
        }))
        .await
        .expect("send request");

    match client.recv_envelope().await.expect("error reply") {
        ServerEnvelope::Error { code, request_id, .. } => {
            assert_eq!(code, 4040);
            assert_eq!(request_id, Some("r1".to_owned()));
        }
        other => panic!("expected ERROR 4040, got {other:?}"),
    }
}

//! S2 -- mixed-topic subscribe with no auth: the restricted topic is
//! rejected but the public one still succeeds.

mod common;

use gateway_test_utils::MockGatewayClient;
use protocol::ServerEnvelope;

#[tokio::test]
async fn restricted_topic_fails_while_public_topic_still_subscribes() {
    let (_pool, addr, _state) = common::start_server().await;
    let mut client = MockGatewayClient::connect(&common::ws_url(addr))
        .await
        .expect("connect");

    let _ = client.recv_envelope().await.expect("connect ack");

    client
        .send_json(&serde_json::json!({
            "type": "SUBSCRIBE",
            "topics": ["portfolio", "market-data"],
        }))
        .await
        .expect("send subscribe");

    match client.recv_envelope().await.expect("error for portfolio") {
        ServerEnvelope::Error { code, topic, .. } => {
            assert_eq!(code, 4010);
            assert_eq!(topic, Some("portfolio".to_owned()));
        }
        other => panic!("expected ERROR 4010, got {other:?}"),
    }

    match client.recv_envelope().await.expect("subscribe ack") {
        ServerEnvelope::Acknowledgment { operation, topics, .. } => {
            assert_eq!(operation, "subscribe");
            assert_eq!(topics, Some(vec!["market-data".to_owned()]));
        }
        other => panic!("expected subscribe ACK, got {other:?}"),
    }

    match client.recv_envelope().await.expect("initial data") {
        ServerEnvelope::Data { topic, .. } => assert_eq!(topic, "market-data"),
        other => panic!("expected initial DATA, got {other:?}"),
    }
}

//! Offline Message store: an authenticated principal with no live
//! connection subscribed to a directed topic gets the message replayed
//! the next time they SUBSCRIBE to it, per §4.I.

mod common;

use std::time::Duration;

use gateway_test_utils::MockGatewayClient;
use protocol::{Role, ServerEnvelope};

#[tokio::test]
async fn directed_message_to_an_offline_principal_is_replayed_on_subscribe() {
    let (_pool, addr, state) = common::start_server().await;
    let token = common::issue_token("user-offline", Role::User, "sess-offline", Duration::from_secs(300));

    state
        .broadcaster
        .publish_directed(
            "user-offline",
            ServerEnvelope::data("portfolio", Some("balanceChanged".to_owned()), None, serde_json::json!({"balance": 42})),
        )
        .await;

    // `publish_directed` only reaches live connections; since none exist
    // yet for this principal the message above goes nowhere. A real
    // caller wanting store-and-forward uses `publish` with
    // `PublishOpts { store: true, recipient: Some(..) }` instead --
    // exercise that path directly here.
    state
        .broadcaster
        .publish(
            protocol::Topic::Portfolio,
            ServerEnvelope::data(
                "portfolio",
                Some("balanceChanged".to_owned()),
                None,
                serde_json::json!({"balance": 42}),
            ),
            gateway::broadcaster::PublishOpts {
                store: true,
                recipient: Some("user-offline".to_owned()),
            },
        )
        .await;

    let mut client = MockGatewayClient::connect_with_token(&common::ws_url(addr), &token)
        .await
        .expect("connect");
    let _ = client.recv_envelope().await.expect("connect ack");

    client
        .send_json(&serde_json::json!({"type": "SUBSCRIBE", "topics": ["portfolio"]}))
        .await
        .expect("send subscribe");

    let _ = client.recv_envelope().await.expect("subscribe ack");
    let _ = client.recv_envelope().await.expect("initial snapshot");

    match client.recv_envelope().await.expect("replayed offline message") {
        ServerEnvelope::Data { topic, action, data, .. } => {
            assert_eq!(topic, "portfolio");
            assert_eq!(action, Some("balanceChanged".to_owned()));
            assert_eq!(data, serde_json::json!({"balance": 42}));
        }
        other => panic!("expected replayed DATA, got {other:?}"),
    }
}

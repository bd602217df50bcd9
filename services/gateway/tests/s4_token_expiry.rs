//! S4 -- token expiry mid-session: the connection is downgraded in place,
//! not closed, and a subsequent SUBSCRIBE to a topic the new (anonymous)
//! role can't satisfy is rejected.

mod common;

use std::time::Duration;

use gateway_test_utils::MockGatewayClient;
use protocol::{Role, ServerEnvelope};

#[tokio::test]
async fn expired_token_downgrades_identity_without_closing_the_socket() {
    let (_pool, addr, _state) = common::start_server().await;
    let token = common::issue_token("user-1", Role::User, "sess-1", Duration::from_secs(2));

    let mut client = MockGatewayClient::connect_with_token(&common::ws_url(addr), &token)
        .await
        .expect("connect");
    let _ = client.recv_envelope().await.expect("connect ack");

    let value = client
        .recv_with_timeout(Duration::from_secs(4))
        .await
        .expect("expiry notice");
    match serde_json::from_value::<ServerEnvelope>(value).expect("valid envelope") {
        ServerEnvelope::Error { code, .. } => assert_eq!(code, 4401),
        other => panic!("expected ERROR 4401, got {other:?}"),
    }

    client
        .send_json(&serde_json::json!({"type": "SUBSCRIBE", "topics": ["portfolio"]}))
        .await
        .expect("send subscribe after downgrade");

    match client.recv_envelope().await.expect("rejected subscribe") {
        ServerEnvelope::Error { code, topic, .. } => {
            assert_eq!(code, 4010);
            assert_eq!(topic, Some("portfolio".to_owned()));
        }
        other => panic!("expected ERROR 4010 after downgrade, got {other:?}"),
    }
}

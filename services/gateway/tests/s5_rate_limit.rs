//! S5 -- per-connection rate limiting: a burst past `B_conn` gets
//! ERROR 4029 for the excess, not a dropped connection.

mod common;

use gateway_test_utils::MockGatewayClient;
use protocol::ServerEnvelope;

fn get_server_time(id: usize) -> serde_json::Value {
    serde_json::json!({
        "type": "REQUEST",
        "topic": "system",
        "action": "getServerTime",
        "requestId": format!("r{id}"),
        "data": {},
    })
}

#[tokio::test]
async fn burst_past_capacity_is_rate_limited_without_closing() {
    let (_pool, addr, _state) = common::start_server().await;
    let mut client = MockGatewayClient::connect(&common::ws_url(addr))
        .await
        .expect("connect");
    let _ = client.recv_envelope().await.expect("connect ack");

    const BURST: usize = 40;
    for i in 0..BURST {
        client
            .send_json(&get_server_time(i))
            .await
            .expect("send burst request");
    }

    let mut rate_limited = 0;
    let mut served = 0;
    for _ in 0..BURST {
        match client.recv_envelope().await.expect("burst reply") {
            ServerEnvelope::Error { code, .. } if code == 4029 => rate_limited += 1,
            ServerEnvelope::Data { .. } => served += 1,
            other => panic!("unexpected reply to burst: {other:?}"),
        }
    }

    assert!(served >= 28 && served <= 32, "served = {served}");
    assert!(rate_limited >= 6, "rate_limited = {rate_limited}");

    // The connection itself must still be usable afterward, once the
    // bucket has had a moment to refill.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    client
        .send_json(&get_server_time(BURST))
        .await
        .expect("send after burst");
    match client.recv_envelope().await.expect("post-burst reply") {
        ServerEnvelope::Data { .. } => {}
        other => panic!("expected the connection to still serve requests, got {other:?}"),
    }
}

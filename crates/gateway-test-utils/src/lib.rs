// gateway-test-utils: Shared test driver for the messaging gateway's
// integration suite.
//
// Provides a thin WebSocket client used by `services/gateway`'s
// `tests/` to exercise the real `axum::Router` end to end, the same way
// `rt-test-utils` drove the forwarder/receiver protocol in this
// codebase's earlier incarnation.

pub mod mock_ws_client;

pub use mock_ws_client::MockGatewayClient;

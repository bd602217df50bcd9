use async_trait::async_trait;
use protocol::{AuthRequirement, Identity};

use super::{ConnectContext, TopicHandler};
use crate::error::GatewayError;

/// The gateway's own handler for the `system` topic. It answers
/// heartbeat-adjacent requests (`getServerTime`) directly rather than
/// delegating to an external collaborator -- `system` is infrastructure,
/// not a business-logic topic.
pub struct SystemHandler;

#[async_trait]
impl TopicHandler for SystemHandler {
    fn auth_requirement(&self) -> AuthRequirement {
        AuthRequirement::None
    }

    async fn on_subscribe(
        &self,
        _ctx: &ConnectContext,
        _identity: &Identity,
    ) -> Option<serde_json::Value> {
        None
    }

    async fn on_unsubscribe(&self, _ctx: &ConnectContext, _identity: &Identity) {}

    async fn request(
        &self,
        _identity: &Identity,
        action: &str,
        _data: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        match action {
            "getServerTime" => Ok(serde_json::json!({
                "serverTime": chrono::Utc::now().to_rfc3339(),
            })),
            other => Err(GatewayError::NotFound(other.to_owned())),
        }
    }

    async fn command(
        &self,
        _identity: &Identity,
        action: &str,
        _data: serde_json::Value,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::NotFound(action.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_server_time_returns_a_timestamp() {
        let reply = SystemHandler
            .request(&Identity::anonymous(), "getServerTime", serde_json::json!({}))
            .await
            .unwrap();
        assert!(reply["serverTime"].is_string());
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let err = SystemHandler
            .request(&Identity::anonymous(), "bogus", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.wire_code(), protocol::error_codes::NOT_FOUND);
    }
}

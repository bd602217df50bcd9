use async_trait::async_trait;
use protocol::{AuthRequirement, Identity};

use super::{ConnectContext, TopicHandler};
use crate::error::GatewayError;

/// A reference handler for public/optional-auth topics: returns a static
/// snapshot on subscribe and echoes back whatever `data` a REQUEST or
/// COMMAND sent. Exists to make the handler interface concrete and
/// testable -- real market-data/contest/skyduel business logic lives
/// behind this trait in a real deployment.
pub struct EchoHandler {
    auth_requirement: AuthRequirement,
}

impl EchoHandler {
    pub fn new(auth_requirement: AuthRequirement) -> Self {
        Self { auth_requirement }
    }
}

#[async_trait]
impl TopicHandler for EchoHandler {
    fn auth_requirement(&self) -> AuthRequirement {
        self.auth_requirement
    }

    async fn on_subscribe(
        &self,
        _ctx: &ConnectContext,
        _identity: &Identity,
    ) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "snapshot": true }))
    }

    async fn on_unsubscribe(&self, _ctx: &ConnectContext, _identity: &Identity) {}

    async fn request(
        &self,
        _identity: &Identity,
        _action: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        Ok(data)
    }

    async fn command(
        &self,
        _identity: &Identity,
        _action: &str,
        _data: serde_json::Value,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_echoes_data_verbatim() {
        let handler = EchoHandler::new(AuthRequirement::None);
        let data = serde_json::json!({"symbol": "BTC"});
        let reply = handler
            .request(&Identity::anonymous(), "getToken", data.clone())
            .await
            .unwrap();
        assert_eq!(reply, data);
    }

    #[tokio::test]
    async fn subscribe_returns_a_snapshot() {
        let handler = EchoHandler::new(AuthRequirement::None);
        let ctx = ConnectContext {
            connection_id: uuid::Uuid::new_v4(),
            device_id: None,
        };
        let snapshot = handler.on_subscribe(&ctx, &Identity::anonymous()).await;
        assert!(snapshot.is_some());
    }
}

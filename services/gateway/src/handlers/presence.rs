use async_trait::async_trait;
use protocol::{AuthRequirement, Identity};

use super::{ConnectContext, TopicHandler};
use crate::error::GatewayError;

/// A reference handler for required/admin topics: the subscribing
/// principal's own identity is echoed back as an "online" snapshot, and
/// REQUEST/COMMAND are handled per-principal rather than broadcast-wide.
/// Stands in for `portfolio`/`user`/`wallet`/`admin`-shaped handlers whose
/// concrete business logic is out of scope.
pub struct PresenceHandler {
    auth_requirement: AuthRequirement,
}

impl PresenceHandler {
    pub fn new(auth_requirement: AuthRequirement) -> Self {
        Self { auth_requirement }
    }
}

#[async_trait]
impl TopicHandler for PresenceHandler {
    fn auth_requirement(&self) -> AuthRequirement {
        self.auth_requirement
    }

    async fn on_subscribe(
        &self,
        _ctx: &ConnectContext,
        identity: &Identity,
    ) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "principalId": identity.principal_id,
            "online": true,
        }))
    }

    async fn on_unsubscribe(&self, _ctx: &ConnectContext, _identity: &Identity) {}

    async fn request(
        &self,
        identity: &Identity,
        _action: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        if identity.is_anonymous() {
            return Err(GatewayError::AuthRequired {
                topic: "presence".to_owned(),
            });
        }
        Ok(data)
    }

    async fn command(
        &self,
        identity: &Identity,
        _action: &str,
        _data: serde_json::Value,
    ) -> Result<(), GatewayError> {
        if identity.is_anonymous() {
            return Err(GatewayError::AuthRequired {
                topic: "presence".to_owned(),
            });
        }
        Ok(())
    }
}

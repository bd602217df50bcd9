mod echo;
mod presence;
mod system;

pub use echo::EchoHandler;
pub use presence::PresenceHandler;
pub use system::SystemHandler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{AuthRequirement, Identity, Topic};

use crate::error::GatewayError;
use crate::registry::ConnectionId;

/// Connection-scoped context threaded through to handlers. `device_id`
/// comes from the optional `x-device-id` handshake header and is never
/// interpreted by the gateway itself -- it is the handler's concern.
#[derive(Debug, Clone)]
pub struct ConnectContext {
    pub connection_id: ConnectionId,
    pub device_id: Option<String>,
}

/// The contract every topic implements. The gateway owns this interface,
/// not the business logic behind it -- concrete per-topic behavior
/// (market-data feeds, contest evaluation, portfolio valuation, wallet
/// signing) lives behind this trait and is explicitly out of scope.
///
/// A handler never reaches into the subscription registry; it only ever
/// returns data for the dispatcher to fan out, or calls back through a
/// [`crate::broadcaster::Broadcaster`] it was constructed with.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    fn auth_requirement(&self) -> AuthRequirement;

    /// May return a seed DATA payload delivered as `action:"initial"`.
    async fn on_subscribe(
        &self,
        ctx: &ConnectContext,
        identity: &Identity,
    ) -> Option<serde_json::Value>;

    async fn on_unsubscribe(&self, ctx: &ConnectContext, identity: &Identity);

    async fn request(
        &self,
        identity: &Identity,
        action: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError>;

    async fn command(
        &self,
        identity: &Identity,
        action: &str,
        data: serde_json::Value,
    ) -> Result<(), GatewayError>;
}

/// The handler table built once at startup, per the "one `Gateway` value
/// constructed at startup" redesign note -- every topic in the closed set
/// has an entry by the time the first connection is accepted.
pub struct HandlerTable {
    handlers: HashMap<Topic, Arc<dyn TopicHandler>>,
}

impl HandlerTable {
    /// Registers the reference handlers that ship with the gateway: an
    /// `EchoHandler` for public/optional-auth topics, a `PresenceHandler`
    /// for required/admin topics, and the internal `SystemHandler` for
    /// `system`. Every topic in [`Topic::ALL`] is covered.
    pub fn with_defaults() -> Self {
        let mut handlers: HashMap<Topic, Arc<dyn TopicHandler>> = HashMap::new();

        handlers.insert(Topic::MarketData, Arc::new(EchoHandler::new(AuthRequirement::None)));
        handlers.insert(Topic::System, Arc::new(SystemHandler));
        handlers.insert(
            Topic::Contest,
            Arc::new(EchoHandler::new(AuthRequirement::Optional)),
        );
        handlers.insert(
            Topic::Skyduel,
            Arc::new(EchoHandler::new(AuthRequirement::Optional)),
        );
        handlers.insert(
            Topic::Portfolio,
            Arc::new(PresenceHandler::new(AuthRequirement::Required)),
        );
        handlers.insert(
            Topic::User,
            Arc::new(PresenceHandler::new(AuthRequirement::Required)),
        );
        handlers.insert(
            Topic::Wallet,
            Arc::new(PresenceHandler::new(AuthRequirement::Required)),
        );
        handlers.insert(
            Topic::WalletBalance,
            Arc::new(PresenceHandler::new(AuthRequirement::Required)),
        );
        handlers.insert(
            Topic::Admin,
            Arc::new(PresenceHandler::new(AuthRequirement::Admin)),
        );

        debug_assert_eq!(handlers.len(), Topic::ALL.len());
        Self { handlers }
    }

    pub fn get(&self, topic: Topic) -> Option<Arc<dyn TopicHandler>> {
        self.handlers.get(&topic).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_closed_set_topic_has_a_handler() {
        let table = HandlerTable::with_defaults();
        for topic in Topic::ALL {
            assert!(table.get(topic).is_some(), "missing handler for {topic:?}");
        }
    }
}

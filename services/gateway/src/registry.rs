use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use protocol::{Identity, Topic};
use uuid::Uuid;

use crate::error::GatewayError;

pub type ConnectionId = Uuid;

/// One failed topic from a `subscribe` call, carrying enough to build the
/// per-topic ERROR the dispatcher emits.
pub struct SubscribeFailure {
    pub topic: String,
    pub error: GatewayError,
}

/// Topic <-> connection index. `Connection` exclusively owns its own
/// subscription set; every other component goes through this registry by
/// `ConnectionId` rather than reaching into a connection directly, per the
/// "cross-component reach-ins" redesign note.
///
/// A single `RwLock` is used here; sharding the map by topic hash is the
/// documented escape hatch if this lock becomes a hotspot at very high
/// connection counts, but nothing in this gateway's test scenarios needs
/// it.
pub struct SubscriptionRegistry {
    by_topic: RwLock<HashMap<Topic, HashSet<ConnectionId>>>,
    by_connection: RwLock<HashMap<ConnectionId, HashSet<Topic>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            by_topic: RwLock::new(HashMap::new()),
            by_connection: RwLock::new(HashMap::new()),
        }
    }

    /// Checks each requested topic's auth requirement against `identity`,
    /// adds the passing ones to the index, and returns the failures. The
    /// caller (dispatcher) is responsible for ACK-ing the successes and
    /// emitting one ERROR per failure, and for asking handlers for initial
    /// state on the newly-added topics.
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
        topics: &[String],
    ) -> (Vec<Topic>, Vec<SubscribeFailure>) {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for raw in topics {
            let Some(topic) = Topic::parse(raw) else {
                failed.push(SubscribeFailure {
                    topic: raw.clone(),
                    error: GatewayError::NotFound(raw.clone()),
                });
                continue;
            };

            let requirement = topic.auth_requirement();
            if !identity.role.satisfies(requirement) {
                let error = if identity.is_anonymous() {
                    GatewayError::AuthRequired {
                        topic: raw.clone(),
                    }
                } else {
                    GatewayError::RoleRequired {
                        topic: raw.clone(),
                    }
                };
                failed.push(SubscribeFailure {
                    topic: raw.clone(),
                    error,
                });
                continue;
            }

            self.by_topic
                .write()
                .expect("by_topic lock")
                .entry(topic)
                .or_default()
                .insert(connection_id);
            self.by_connection
                .write()
                .expect("by_connection lock")
                .entry(connection_id)
                .or_default()
                .insert(topic);
            succeeded.push(topic);
        }

        (succeeded, failed)
    }

    /// Idempotent removal.
    pub fn unsubscribe(&self, connection_id: ConnectionId, topics: &[String]) -> Vec<Topic> {
        let mut removed = Vec::new();
        for raw in topics {
            let Some(topic) = Topic::parse(raw) else {
                continue;
            };
            self.remove_one(connection_id, topic);
            removed.push(topic);
        }
        removed
    }

    fn remove_one(&self, connection_id: ConnectionId, topic: Topic) {
        if let Some(set) = self.by_topic.write().expect("by_topic lock").get_mut(&topic) {
            set.remove(&connection_id);
        }
        if let Some(set) = self
            .by_connection
            .write()
            .expect("by_connection lock")
            .get_mut(&connection_id)
        {
            set.remove(&topic);
        }
    }

    /// Revokes subscriptions to topics whose auth requirement the given
    /// identity no longer satisfies (used on token expiry / downgrade to
    /// anonymous). Returns the topics that were revoked.
    pub fn revoke_unsatisfied(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
    ) -> Vec<Topic> {
        let current: Vec<Topic> = self
            .by_connection
            .read()
            .expect("by_connection lock")
            .get(&connection_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut revoked = Vec::new();
        for topic in current {
            if !identity.role.satisfies(topic.auth_requirement()) {
                self.remove_one(connection_id, topic);
                revoked.push(topic);
            }
        }
        revoked
    }

    /// Snapshot iterator of subscribers -- safe to call while
    /// subscribes/unsubscribes happen concurrently; no point-in-time
    /// consistency is promised beyond this snapshot.
    pub fn subscribers_of(&self, topic: Topic) -> Vec<ConnectionId> {
        self.by_topic
            .read()
            .expect("by_topic lock")
            .get(&topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn on_connection_closed(&self, connection_id: ConnectionId) {
        let topics = self
            .by_connection
            .write()
            .expect("by_connection lock")
            .remove(&connection_id)
            .unwrap_or_default();
        let mut by_topic = self.by_topic.write().expect("by_topic lock");
        for topic in topics {
            if let Some(set) = by_topic.get_mut(&topic) {
                set.remove(&connection_id);
            }
        }
    }

    pub fn subscriptions_of(&self, connection_id: ConnectionId) -> HashSet<Topic> {
        self.by_connection
            .read()
            .expect("by_connection lock")
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_identity() -> Identity {
        Identity {
            principal_id: Some("user-1".to_owned()),
            role: protocol::Role::User,
            session_id: Some("sess-1".to_owned()),
            expires_at: None,
        }
    }

    #[test]
    fn subscribe_public_topic_succeeds_anonymous() {
        let registry = SubscriptionRegistry::new();
        let conn = Uuid::new_v4();
        let (ok, failed) = registry.subscribe(conn, &Identity::anonymous(), &["market-data".to_owned()]);
        assert_eq!(ok, vec![Topic::MarketData]);
        assert!(failed.is_empty());
        assert_eq!(registry.subscribers_of(Topic::MarketData), vec![conn]);
    }

    #[test]
    fn subscribe_restricted_topic_fails_anonymous() {
        let registry = SubscriptionRegistry::new();
        let conn = Uuid::new_v4();
        let (ok, failed) = registry.subscribe(
            conn,
            &Identity::anonymous(),
            &["portfolio".to_owned(), "market-data".to_owned()],
        );
        assert_eq!(ok, vec![Topic::MarketData]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].topic, "portfolio");
        assert_eq!(failed[0].error.wire_code(), protocol::error_codes::AUTH_REQUIRED);
        assert!(registry.subscribers_of(Topic::Portfolio).is_empty());
    }

    #[test]
    fn subscribe_admin_topic_fails_for_authenticated_user() {
        let registry = SubscriptionRegistry::new();
        let conn = Uuid::new_v4();
        let (ok, failed) = registry.subscribe(conn, &user_identity(), &["admin".to_owned()]);
        assert!(ok.is_empty());
        assert_eq!(failed[0].error.wire_code(), protocol::error_codes::ROLE_REQUIRED);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let conn = Uuid::new_v4();
        registry.subscribe(conn, &Identity::anonymous(), &["market-data".to_owned()]);
        registry.unsubscribe(conn, &["market-data".to_owned()]);
        registry.unsubscribe(conn, &["market-data".to_owned()]);
        assert!(registry.subscribers_of(Topic::MarketData).is_empty());
    }

    #[test]
    fn on_connection_closed_removes_from_every_topic() {
        let registry = SubscriptionRegistry::new();
        let conn = Uuid::new_v4();
        registry.subscribe(
            conn,
            &user_identity(),
            &["market-data".to_owned(), "portfolio".to_owned()],
        );
        registry.on_connection_closed(conn);
        assert!(registry.subscribers_of(Topic::MarketData).is_empty());
        assert!(registry.subscribers_of(Topic::Portfolio).is_empty());
        assert!(registry.subscriptions_of(conn).is_empty());
    }

    #[test]
    fn revoke_unsatisfied_removes_only_now_forbidden_topics() {
        let registry = SubscriptionRegistry::new();
        let conn = Uuid::new_v4();
        registry.subscribe(
            conn,
            &user_identity(),
            &["market-data".to_owned(), "portfolio".to_owned()],
        );
        let revoked = registry.revoke_unsatisfied(conn, &Identity::anonymous());
        assert_eq!(revoked, vec![Topic::Portfolio]);
        assert_eq!(registry.subscribers_of(Topic::MarketData), vec![conn]);
        assert!(registry.subscribers_of(Topic::Portfolio).is_empty());
    }
}

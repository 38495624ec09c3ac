//! Ports consumed by the engine.
//!
//! Persistence, delivery, presence, roster lookups and cluster transport are
//! owned by the host server. Each is a trait object held by
//! [`PubSubService`](crate::PubSubService); this module also provides the
//! in-process implementations used by non-durable deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cluster::ClusterTask;
use crate::error::PersistenceError;
use crate::form::DataForm;
use crate::item::{ItemKey, StoredItem};
use crate::node::{DefaultNodeConfiguration, NodeAffiliate, NodeSubscription};
use crate::persistence::{NodeSnapshot, StoredNode};
use crate::types::NodeType;

// ============================================================================
// Notifications
// ============================================================================

/// One item as carried by an event notification or an items result.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemView {
    pub id: String,
    pub publisher: Jid,
    pub published_at: DateTime<Utc>,
    /// Present only when the node delivers payloads (or the caller forced it).
    pub payload: Option<Element>,
}

/// Items published to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemsEvent {
    pub node_id: String,
    pub items: Vec<ItemView>,
    /// Subscriptions of the recipient this event satisfies (SHIM `SubID` headers).
    pub subscription_ids: Vec<String>,
    /// Whether the recipient asked for a message body.
    pub include_body: bool,
    /// Original publication time when replaying the last published item.
    pub delayed: Option<DateTime<Utc>>,
}

/// Event produced by the engine for delivery to an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// New or replayed items.
    Items(ItemsEvent),
    /// Items retracted from a node.
    Retract {
        node_id: String,
        item_ids: Vec<String>,
        subscription_ids: Vec<String>,
    },
    /// Every item but the most recent was removed.
    Purge { node_id: String },
    /// Node was deleted.
    Delete { node_id: String },
    /// Node configuration changed. Carries the form when payloads are delivered.
    Configuration {
        node_id: String,
        form: Option<DataForm>,
    },
    /// A node was added to a collection.
    NodeAssociated {
        collection_id: String,
        node_id: String,
    },
    /// A node was removed from a collection.
    NodeDissociated {
        collection_id: String,
        node_id: String,
    },
    /// An owner is asked to approve a pending subscription.
    AuthorizationRequest {
        node_id: String,
        subscription_id: String,
        subscriber: Jid,
    },
}

impl Notification {
    /// Node the event refers to.
    pub fn node_id(&self) -> &str {
        match self {
            Notification::Items(event) => &event.node_id,
            Notification::Retract { node_id, .. }
            | Notification::Purge { node_id }
            | Notification::Delete { node_id }
            | Notification::Configuration { node_id, .. }
            | Notification::AuthorizationRequest { node_id, .. } => node_id,
            Notification::NodeAssociated { collection_id, .. }
            | Notification::NodeDissociated { collection_id, .. } => collection_id,
        }
    }

    /// Short event name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Items(_) => "items",
            Notification::Retract { .. } => "retract",
            Notification::Purge { .. } => "purge",
            Notification::Delete { .. } => "delete",
            Notification::Configuration { .. } => "configuration",
            Notification::NodeAssociated { .. } => "associate",
            Notification::NodeDissociated { .. } => "dissociate",
            Notification::AuthorizationRequest { .. } => "authorization",
        }
    }
}

// ============================================================================
// Broadcast
// ============================================================================

/// Delivers notifications. Fire-and-forget: the engine never awaits delivery.
pub trait BroadcastPort: Send + Sync + 'static {
    /// Deliver a notification to a single entity.
    fn send(&self, to: &Jid, notification: Notification);

    /// Deliver the same notification to several entities.
    fn broadcast(&self, node_id: &str, notification: Notification, targets: &[Jid]) {
        debug!(node = %node_id, recipients = targets.len(), kind = notification.kind(), "Broadcasting");
        for target in targets {
            self.send(target, notification.clone());
        }
    }
}

/// A notification addressed to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: Jid,
    pub notification: Notification,
}

/// Broadcaster that hands deliveries to an unbounded channel drained by the
/// protocol layer's outbound router.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelBroadcaster {
    /// Create a broadcaster and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BroadcastPort for ChannelBroadcaster {
    fn send(&self, to: &Jid, notification: Notification) {
        let delivery = Delivery {
            to: to.clone(),
            notification,
        };
        if self.tx.send(delivery).is_err() {
            debug!(to = %to, "Delivery channel closed, dropping notification");
        }
    }
}

// ============================================================================
// Presence
// ============================================================================

/// Presence lookups and presence subscription requests.
pub trait PresencePort: Send + Sync + 'static {
    /// Show values of the entity's available resources. A bare JID returns
    /// every resource; a full JID only that resource. Empty means offline.
    fn show_presences(&self, jid: &Jid) -> Vec<String>;

    /// Ask to receive the user's presence.
    fn subscribe(&self, user: &BareJid);

    /// Stop receiving the user's presence.
    fn unsubscribe(&self, user: &BareJid);
}

// ============================================================================
// Roster
// ============================================================================

/// Subscription state of a roster item (RFC 6121).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RosterSubscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl RosterSubscription {
    /// Whether the contact receives the owner's presence.
    pub fn contact_sees_presence(&self) -> bool {
        matches!(self, RosterSubscription::From | RosterSubscription::Both)
    }
}

/// A contact in a node owner's roster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RosterItem {
    pub subscription: RosterSubscription,
    pub groups: Vec<String>,
}

/// Roster lookups for the `presence` and `roster` access models.
pub trait RosterPort: Send + Sync + 'static {
    /// The roster item `owner` keeps for `contact`, if any.
    fn roster_item(&self, owner: &BareJid, contact: &BareJid) -> Option<RosterItem>;
}

/// In-memory roster table.
#[derive(Debug, Default)]
pub struct StaticRoster {
    items: DashMap<(BareJid, BareJid), RosterItem>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a roster item.
    pub fn insert(&self, owner: BareJid, contact: BareJid, item: RosterItem) {
        self.items.insert((owner, contact), item);
    }

    /// Remove a roster item.
    pub fn remove(&self, owner: &BareJid, contact: &BareJid) {
        self.items.remove(&(owner.clone(), contact.clone()));
    }
}

impl RosterPort for StaticRoster {
    fn roster_item(&self, owner: &BareJid, contact: &BareJid) -> Option<RosterItem> {
        self.items
            .get(&(owner.clone(), contact.clone()))
            .map(|entry| entry.value().clone())
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// Mirrors state changes to other cluster members.
#[async_trait]
pub trait ClusterPort: Send + Sync + 'static {
    /// Send a task to every other member without waiting.
    fn do_cluster_task(&self, task: ClusterTask);

    /// Send a task to every other member and wait until all ran it.
    async fn do_synchronous_cluster_task(&self, task: ClusterTask);
}

/// Cluster port for a single-member deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneCluster;

#[async_trait]
impl ClusterPort for StandaloneCluster {
    fn do_cluster_task(&self, task: ClusterTask) {
        debug!(task = task.name(), "No cluster peers, dropping task");
    }

    async fn do_synchronous_cluster_task(&self, task: ClusterTask) {
        debug!(task = task.name(), "No cluster peers, dropping synchronous task");
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Durable storage for nodes, affiliations, subscriptions and items.
///
/// Item writes never come straight from the request path: they are batched
/// by the service's write-behind queue and handed over through
/// [`flush_pending_items`](PersistencePort::flush_pending_items).
#[async_trait]
pub trait PersistencePort: Send + Sync + 'static {
    async fn create_node(&self, node: &NodeSnapshot) -> Result<(), PersistenceError>;

    async fn update_node(&self, node: &NodeSnapshot) -> Result<(), PersistenceError>;

    /// Remove a node together with its affiliations, subscriptions and items.
    async fn remove_node(&self, node_id: &str) -> Result<(), PersistenceError>;

    /// Every node stored for the service.
    async fn load_nodes(&self) -> Result<Vec<StoredNode>, PersistenceError>;

    async fn create_affiliation(
        &self,
        node_id: &str,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PersistenceError>;

    async fn update_affiliation(
        &self,
        node_id: &str,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PersistenceError>;

    async fn remove_affiliation(&self, node_id: &str, jid: &BareJid)
        -> Result<(), PersistenceError>;

    async fn create_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), PersistenceError>;

    async fn update_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), PersistenceError>;

    async fn remove_subscription(
        &self,
        node_id: &str,
        subscription_id: &str,
    ) -> Result<(), PersistenceError>;

    /// Apply a batch of item writes in one transaction: deletes first, then adds.
    async fn flush_pending_items(
        &self,
        adds: &[StoredItem],
        deletes: &[ItemKey],
    ) -> Result<(), PersistenceError>;

    async fn get_published_item(&self, key: &ItemKey)
        -> Result<Option<StoredItem>, PersistenceError>;

    /// Stored items of a node, oldest first; `max` keeps only the most recent.
    async fn get_published_items(
        &self,
        node_id: &str,
        max: Option<usize>,
    ) -> Result<Vec<StoredItem>, PersistenceError>;

    async fn get_last_published_item(
        &self,
        node_id: &str,
    ) -> Result<Option<StoredItem>, PersistenceError>;

    /// Delete all but the `keep` most recent stored items. Returns the number removed.
    async fn purge_items_beyond(&self, node_id: &str, keep: usize)
        -> Result<usize, PersistenceError>;

    async fn load_default_configuration(
        &self,
        node_type: NodeType,
    ) -> Result<Option<DefaultNodeConfiguration>, PersistenceError>;

    async fn create_default_configuration(
        &self,
        config: &DefaultNodeConfiguration,
    ) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_broadcaster_delivers() {
        let (broadcaster, mut rx) = ChannelBroadcaster::new();
        let targets: Vec<Jid> = vec![
            "alice@example.com".parse().unwrap(),
            "bob@example.com/desk".parse().unwrap(),
        ];
        broadcaster.broadcast(
            "news",
            Notification::Purge {
                node_id: "news".to_string(),
            },
            &targets,
        );

        let first = rx.try_recv().expect("first delivery");
        let second = rx.try_recv().expect("second delivery");
        assert_eq!(first.to, targets[0]);
        assert_eq!(second.to, targets[1]);
        assert_eq!(second.notification.node_id(), "news");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_static_roster_lookup() {
        let roster = StaticRoster::new();
        let owner: BareJid = "owner@example.com".parse().unwrap();
        let contact: BareJid = "friend@example.com".parse().unwrap();
        roster.insert(
            owner.clone(),
            contact.clone(),
            RosterItem {
                subscription: RosterSubscription::Both,
                groups: vec!["Friends".to_string()],
            },
        );

        let item = roster.roster_item(&owner, &contact).expect("item exists");
        assert!(item.subscription.contact_sees_presence());
        assert!(roster.roster_item(&contact, &owner).is_none());

        roster.remove(&owner, &contact);
        assert!(roster.roster_item(&owner, &contact).is_none());
    }

    #[test]
    fn test_notification_node_id() {
        let event = Notification::NodeAssociated {
            collection_id: "parent".to_string(),
            node_id: "child".to_string(),
        };
        assert_eq!(event.node_id(), "parent");
        assert_eq!(event.kind(), "associate");
    }
}

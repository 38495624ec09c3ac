//! Persistence records and the in-memory store.
//!
//! The engine keeps its model in memory and writes through a
//! [`PersistencePort`]. Node metadata, affiliations and subscriptions are
//! written as they change; item writes go through the write-behind
//! [`ItemQueue`].

mod queue;

pub use queue::ItemQueue;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PersistenceError;
use crate::item::{ItemKey, StoredItem};
use crate::node::{
    CollectionConfig, DefaultNodeConfiguration, LeafConfig, NodeAffiliate, NodeConfig,
    NodeSubscription,
};
use crate::ports::PersistencePort;
use crate::types::NodeType;

/// Persistent form of a node's metadata and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub service_id: String,
    pub node_type: NodeType,
    pub parent: Option<String>,
    pub creator: Jid,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub config: NodeConfig,
    pub leaf: Option<LeafConfig>,
    pub collection: Option<CollectionConfig>,
}

/// A node as loaded at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNode {
    pub node: NodeSnapshot,
    pub affiliates: Vec<NodeAffiliate>,
    pub subscriptions: Vec<NodeSubscription>,
}

impl StoredNode {
    pub fn new(node: NodeSnapshot) -> Self {
        Self {
            node,
            affiliates: Vec::new(),
            subscriptions: Vec::new(),
        }
    }
}

/// Log a failed write and keep going: the in-memory model stays
/// authoritative.
pub(crate) fn log_failure<T>(
    result: Result<T, PersistenceError>,
    operation: &'static str,
    node_id: &str,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(node = %node_id, operation, error = %e, "Persistence operation failed");
            None
        }
    }
}

/// Non-durable store backed by concurrent maps.
///
/// Used by deployments without a database and by tests, which can make item
/// flushes fail on demand.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    nodes: DashMap<String, StoredNode>,
    /// Items per node, oldest first.
    items: DashMap<String, Vec<StoredItem>>,
    defaults: DashMap<NodeType, DefaultNodeConfiguration>,
    fail_flushes: AtomicBool,
    flushes: AtomicUsize,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent item flushes fail (or succeed again).
    pub fn set_fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful item flushes.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Stored record of a node.
    pub fn stored_node(&self, node_id: &str) -> Option<StoredNode> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    /// Number of stored items of a node.
    pub fn item_count(&self, node_id: &str) -> usize {
        self.items.get(node_id).map(|items| items.len()).unwrap_or(0)
    }

    fn with_node<F>(&self, node_id: &str, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut StoredNode),
    {
        match self.nodes.get_mut(node_id) {
            Some(mut entry) => {
                f(entry.value_mut());
                Ok(())
            }
            None => Err(PersistenceError::NotFound(format!("node {node_id}"))),
        }
    }
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn create_node(&self, node: &NodeSnapshot) -> Result<(), PersistenceError> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(PersistenceError::storage(format!(
                "node {} already exists",
                node.node_id
            )));
        }
        self.nodes
            .insert(node.node_id.clone(), StoredNode::new(node.clone()));
        Ok(())
    }

    async fn update_node(&self, node: &NodeSnapshot) -> Result<(), PersistenceError> {
        self.with_node(&node.node_id, |stored| stored.node = node.clone())
    }

    async fn remove_node(&self, node_id: &str) -> Result<(), PersistenceError> {
        self.items.remove(node_id);
        match self.nodes.remove(node_id) {
            Some(_) => Ok(()),
            None => Err(PersistenceError::NotFound(format!("node {node_id}"))),
        }
    }

    async fn load_nodes(&self) -> Result<Vec<StoredNode>, PersistenceError> {
        Ok(self
            .nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn create_affiliation(
        &self,
        node_id: &str,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PersistenceError> {
        self.with_node(node_id, |stored| {
            stored.affiliates.retain(|a| a.jid() != affiliate.jid());
            stored.affiliates.push(affiliate.clone());
        })
    }

    async fn update_affiliation(
        &self,
        node_id: &str,
        affiliate: &NodeAffiliate,
    ) -> Result<(), PersistenceError> {
        self.create_affiliation(node_id, affiliate).await
    }

    async fn remove_affiliation(
        &self,
        node_id: &str,
        jid: &BareJid,
    ) -> Result<(), PersistenceError> {
        self.with_node(node_id, |stored| {
            stored.affiliates.retain(|a| a.jid() != jid);
        })
    }

    async fn create_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), PersistenceError> {
        self.with_node(node_id, |stored| {
            stored.subscriptions.retain(|s| s.id() != subscription.id());
            stored.subscriptions.push(subscription.clone());
        })
    }

    async fn update_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), PersistenceError> {
        self.create_subscription(node_id, subscription).await
    }

    async fn remove_subscription(
        &self,
        node_id: &str,
        subscription_id: &str,
    ) -> Result<(), PersistenceError> {
        self.with_node(node_id, |stored| {
            stored.subscriptions.retain(|s| s.id() != subscription_id);
        })
    }

    async fn flush_pending_items(
        &self,
        adds: &[StoredItem],
        deletes: &[ItemKey],
    ) -> Result<(), PersistenceError> {
        if self.fail_flushes.load(Ordering::SeqCst) {
            return Err(PersistenceError::storage("item flush rejected"));
        }
        for key in deletes {
            if let Some(mut items) = self.items.get_mut(&key.node_id) {
                items.retain(|item| item.item_id != key.item_id);
            }
        }
        for item in adds {
            let mut items = self.items.entry(item.node_id.clone()).or_default();
            items.retain(|existing| existing.item_id != item.item_id);
            let at = items.partition_point(|existing| existing.created_at <= item.created_at);
            items.insert(at, item.clone());
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_published_item(
        &self,
        key: &ItemKey,
    ) -> Result<Option<StoredItem>, PersistenceError> {
        Ok(self.items.get(&key.node_id).and_then(|items| {
            items
                .iter()
                .find(|item| item.item_id == key.item_id)
                .cloned()
        }))
    }

    async fn get_published_items(
        &self,
        node_id: &str,
        max: Option<usize>,
    ) -> Result<Vec<StoredItem>, PersistenceError> {
        let Some(items) = self.items.get(node_id) else {
            return Ok(Vec::new());
        };
        let skip = max.map_or(0, |max| items.len().saturating_sub(max));
        Ok(items.iter().skip(skip).cloned().collect())
    }

    async fn get_last_published_item(
        &self,
        node_id: &str,
    ) -> Result<Option<StoredItem>, PersistenceError> {
        Ok(self
            .items
            .get(node_id)
            .and_then(|items| items.last().cloned()))
    }

    async fn purge_items_beyond(
        &self,
        node_id: &str,
        keep: usize,
    ) -> Result<usize, PersistenceError> {
        let Some(mut items) = self.items.get_mut(node_id) else {
            return Ok(0);
        };
        let excess = items.len().saturating_sub(keep);
        items.drain(..excess);
        Ok(excess)
    }

    async fn load_default_configuration(
        &self,
        node_type: NodeType,
    ) -> Result<Option<DefaultNodeConfiguration>, PersistenceError> {
        Ok(self
            .defaults
            .get(&node_type)
            .map(|entry| entry.value().clone()))
    }

    async fn create_default_configuration(
        &self,
        config: &DefaultNodeConfiguration,
    ) -> Result<(), PersistenceError> {
        self.defaults.insert(config.node_type, config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(node_id: &str) -> NodeSnapshot {
        let defaults = DefaultNodeConfiguration::builtin(NodeType::Leaf);
        NodeSnapshot {
            node_id: node_id.to_string(),
            service_id: "pubsub".to_string(),
            node_type: NodeType::Leaf,
            parent: Some(String::new()),
            creator: "owner@example.com".parse().unwrap(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
            config: defaults.config.clone(),
            leaf: defaults.leaf.clone(),
            collection: None,
        }
    }

    fn stored_item(node_id: &str, item_id: &str, age_secs: i64) -> StoredItem {
        StoredItem {
            node_id: node_id.to_string(),
            item_id: item_id.to_string(),
            publisher: "owner@example.com".parse().unwrap(),
            created_at: Utc::now() - Duration::seconds(age_secs),
            payload_xml: None,
        }
    }

    #[tokio::test]
    async fn test_node_crud() {
        let store = InMemoryPersistence::new();
        store.create_node(&snapshot("news")).await.unwrap();
        assert!(store.create_node(&snapshot("news")).await.is_err());

        let owner = NodeAffiliate::new(
            "owner@example.com".parse().unwrap(),
            crate::types::Affiliation::Owner,
        );
        store.create_affiliation("news", &owner).await.unwrap();
        store.update_affiliation("news", &owner).await.unwrap();
        assert_eq!(store.stored_node("news").unwrap().affiliates.len(), 1);

        store
            .remove_affiliation("news", owner.jid())
            .await
            .unwrap();
        assert!(store.stored_node("news").unwrap().affiliates.is_empty());

        store.remove_node("news").await.unwrap();
        assert_eq!(store.node_count(), 0);
        assert!(matches!(
            store.update_node(&snapshot("news")).await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_applies_deletes_then_adds() {
        let store = InMemoryPersistence::new();
        store
            .flush_pending_items(
                &[stored_item("news", "a", 30), stored_item("news", "b", 20)],
                &[],
            )
            .await
            .unwrap();
        store
            .flush_pending_items(
                &[stored_item("news", "a", 10)],
                &[ItemKey::new("news", "a")],
            )
            .await
            .unwrap();

        let items = store.get_published_items("news", None).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(store.flush_count(), 2);
    }

    #[tokio::test]
    async fn test_purge_items_beyond() {
        let store = InMemoryPersistence::new();
        let items: Vec<StoredItem> = (0..5)
            .map(|i| stored_item("news", &i.to_string(), 100 - i))
            .collect();
        store.flush_pending_items(&items, &[]).await.unwrap();

        assert_eq!(store.purge_items_beyond("news", 2).await.unwrap(), 3);
        let left = store.get_published_items("news", None).await.unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].item_id, "3");
        assert_eq!(
            store
                .get_last_published_item("news")
                .await
                .unwrap()
                .unwrap()
                .item_id,
            "4"
        );
    }

    #[tokio::test]
    async fn test_failing_flush() {
        let store = InMemoryPersistence::new();
        store.set_fail_flushes(true);
        assert!(store
            .flush_pending_items(&[stored_item("news", "a", 0)], &[])
            .await
            .is_err());
        assert_eq!(store.item_count("news"), 0);
    }

    #[test]
    fn test_log_failure() {
        let ok: Result<u8, PersistenceError> = Ok(1);
        assert_eq!(log_failure(ok, "test", "news"), Some(1));
        let err: Result<u8, PersistenceError> = Err(PersistenceError::storage("down"));
        assert_eq!(log_failure(err, "test", "news"), None);
    }
}

//! The pubsub service: node registry and composition root.
//!
//! A [`PubSubService`] owns the node namespace (including the root
//! collection), the default node configurations, presence bookkeeping and
//! the write-behind item queue. It is built once at startup from a
//! [`ServiceConfig`] and a set of [`ServicePorts`] and shared as an `Arc`
//! with the engine and every request handler.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use jid::{BareJid, Jid};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterTask;
use crate::config::ServiceConfig;
use crate::error::{PersistenceError, ServiceError};
use crate::metrics;
use crate::node::{DefaultNodeConfiguration, Node, NodeAffiliate, ROOT_NODE_ID};
use crate::persistence::{log_failure, InMemoryPersistence, ItemQueue};
use crate::ports::{
    BroadcastPort, ClusterPort, Notification, PersistencePort, PresencePort, RosterPort,
    StandaloneCluster, StaticRoster,
};
use crate::presence::{PresenceCache, PresenceTracker};
use crate::types::{Affiliation, NodeType};

/// Collaborators owned by the host server.
#[derive(Clone)]
pub struct ServicePorts {
    pub persistence: Arc<dyn PersistencePort>,
    pub broadcaster: Arc<dyn BroadcastPort>,
    pub presence: Arc<dyn PresencePort>,
    pub roster: Arc<dyn RosterPort>,
    pub cluster: Arc<dyn ClusterPort>,
}

impl ServicePorts {
    /// Non-durable ports around a broadcaster: in-memory store, presence
    /// cache, empty roster and no cluster peers.
    pub fn in_memory(broadcaster: Arc<dyn BroadcastPort>) -> Self {
        Self {
            persistence: Arc::new(InMemoryPersistence::new()),
            broadcaster,
            presence: Arc::new(PresenceCache::new()),
            roster: Arc::new(StaticRoster::new()),
            cluster: Arc::new(StandaloneCluster),
        }
    }
}

/// A pubsub service.
pub struct PubSubService {
    config: ServiceConfig,
    address: BareJid,
    nodes: DashMap<String, Arc<Node>>,
    defaults: DashMap<NodeType, DefaultNodeConfiguration>,
    persistence: Arc<dyn PersistencePort>,
    broadcaster: Arc<dyn BroadcastPort>,
    presence: Arc<dyn PresencePort>,
    roster: Arc<dyn RosterPort>,
    cluster: Arc<dyn ClusterPort>,
    presence_tracker: PresenceTracker,
    item_queue: Arc<ItemQueue>,
    running: AtomicBool,
    senior: AtomicBool,
    clustering: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PubSubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubService")
            .field("service_id", &self.config.service_id)
            .field("address", &self.address)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl PubSubService {
    /// Build a service and load its state: default configurations, every
    /// stored node, and the root collection (created when missing).
    pub async fn new(config: ServiceConfig, ports: ServicePorts) -> Result<Arc<Self>, ServiceError> {
        let address = config.address()?;
        let root_creator = config.root_creator()?;
        let service = Arc::new(Self {
            address,
            nodes: DashMap::new(),
            defaults: DashMap::new(),
            persistence: ports.persistence,
            broadcaster: ports.broadcaster,
            presence: ports.presence,
            roster: ports.roster,
            cluster: ports.cluster,
            presence_tracker: PresenceTracker::new(),
            item_queue: Arc::new(ItemQueue::new(config.max_items_flush)),
            running: AtomicBool::new(true),
            senior: AtomicBool::new(true),
            clustering: AtomicBool::new(config.clustering_enabled),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        service.load_defaults().await?;
        service.load_nodes().await?;
        service.ensure_root(root_creator).await;
        info!(
            service = %service.config.service_id,
            nodes = service.nodes.len(),
            "PubSub service loaded"
        );
        Ok(service)
    }

    async fn load_defaults(&self) -> Result<(), PersistenceError> {
        for node_type in [NodeType::Leaf, NodeType::Collection] {
            let defaults = match self.persistence.load_default_configuration(node_type).await? {
                Some(defaults) => defaults,
                None => {
                    let defaults = DefaultNodeConfiguration::builtin(node_type);
                    log_failure(
                        self.persistence.create_default_configuration(&defaults).await,
                        "create_default_configuration",
                        ROOT_NODE_ID,
                    );
                    defaults
                }
            };
            self.defaults.insert(node_type, defaults);
        }
        Ok(())
    }

    /// Restore stored nodes, then link every node to its parent collection.
    async fn load_nodes(&self) -> Result<(), PersistenceError> {
        let stored = self.persistence.load_nodes().await?;
        for node in stored {
            if node.node.service_id != self.config.service_id {
                continue;
            }
            let node_id = node.node.node_id.clone();
            let items = match &node.node.leaf {
                Some(leaf) if leaf.persist_items => log_failure(
                    self.persistence
                        .get_published_items(&node_id, leaf.effective_max_items())
                        .await,
                    "load_items",
                    &node_id,
                )
                .unwrap_or_default(),
                _ => Vec::new(),
            };
            self.nodes.insert(node_id, Node::restore(node, items));
        }

        for node in self.nodes() {
            let parent_id = node.read().await.core().parent().map(str::to_string);
            let Some(parent_id) = parent_id else {
                continue;
            };
            match self.node(&parent_id) {
                Some(parent) if parent.is_collection() => {
                    let mut parent = parent.write().await;
                    if let Some(collection) = parent.kind.as_collection_mut() {
                        collection.add_child(node.id());
                    }
                }
                _ => warn!(
                    node = %node.id(),
                    parent = %parent_id,
                    "Stored node references a missing parent collection"
                ),
            }
        }
        metrics::record_node_count(self.nodes.len(), &self.config.service_id);
        Ok(())
    }

    async fn ensure_root(&self, root_creator: BareJid) {
        if self.nodes.contains_key(ROOT_NODE_ID) {
            return;
        }
        let defaults = self.default_configuration(NodeType::Collection);
        let root = Node::new(
            ROOT_NODE_ID,
            self.config.service_id.clone(),
            None,
            Jid::from(root_creator.clone()),
            &defaults,
        );
        {
            let mut state = root.write().await;
            state.add_owner(self, &root_creator).await;
            state.save(self).await;
        }
        self.register(root);
        info!(service = %self.config.service_id, owner = %root_creator, "Root collection node created");
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start the background flush and purge tasks.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.item_queue.clone().spawn_flush_task(
            self.persistence.clone(),
            self.config.flush_interval(),
            self.cancel.child_token(),
        ));

        let service = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let interval = self.config.purge_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => service.purge_stored_items().await,
                }
            }
            debug!("Stored item purge task stopped");
        }));
        info!(
            service = %self.config.service_id,
            flush_interval_secs = self.config.flush_interval().as_secs(),
            purge_interval_secs = interval.as_secs(),
            "PubSub service started"
        );
    }

    /// Stop background tasks and flush every pending item write.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        log_failure(
            self.item_queue.flush(self.persistence.as_ref()).await,
            "flush_pending_items",
            ROOT_NODE_ID,
        );
        info!(service = %self.config.service_id, "PubSub service stopped");
    }

    /// Whether the service accepts requests: it is not shut down, and it is
    /// the senior member when clustering is enabled.
    pub fn is_available(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && (!self.clustering.load(Ordering::SeqCst) || self.senior.load(Ordering::SeqCst))
    }

    /// Cluster membership changed.
    pub fn set_senior_member(&self, senior: bool) {
        self.senior.store(senior, Ordering::SeqCst);
        info!(service = %self.config.service_id, senior, "Cluster seniority changed");
    }

    pub fn set_clustering_enabled(&self, enabled: bool) {
        self.clustering.store(enabled, Ordering::SeqCst);
        info!(service = %self.config.service_id, enabled, "Clustering toggled");
    }

    pub fn is_clustering_enabled(&self) -> bool {
        self.clustering.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn service_id(&self) -> &str {
        &self.config.service_id
    }

    pub fn address(&self) -> &BareJid {
        &self.address
    }

    pub fn multiple_subscriptions_enabled(&self) -> bool {
        self.config.multiple_subscriptions_enabled
    }

    /// Sysadmins and trusted node creators.
    pub fn is_service_admin(&self, jid: &Jid) -> bool {
        let bare = jid.to_bare();
        self.config.sysadmins.contains(&bare) || self.config.allowed_to_create.contains(&bare)
    }

    pub fn can_create_node(&self, jid: &Jid) -> bool {
        !self.config.node_creation_restricted || self.is_service_admin(jid)
    }

    /// Defaults for new nodes of a type.
    pub fn default_configuration(&self, node_type: NodeType) -> DefaultNodeConfiguration {
        self.defaults
            .get(&node_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| DefaultNodeConfiguration::builtin(node_type))
    }

    // ------------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------------

    pub fn persistence(&self) -> &dyn PersistencePort {
        self.persistence.as_ref()
    }

    pub fn presence(&self) -> &dyn PresencePort {
        self.presence.as_ref()
    }

    pub fn presence_tracker(&self) -> &PresenceTracker {
        &self.presence_tracker
    }

    pub fn roster(&self) -> &dyn RosterPort {
        self.roster.as_ref()
    }

    pub fn item_queue(&self) -> &ItemQueue {
        &self.item_queue
    }

    /// Deliver a notification to one entity.
    pub fn send(&self, to: &Jid, notification: Notification) {
        metrics::record_notifications(1, notification.kind());
        self.broadcaster.send(to, notification);
    }

    /// Deliver a notification to several entities.
    pub fn broadcast(&self, node_id: &str, notification: Notification, targets: &[Jid]) {
        if targets.is_empty() {
            return;
        }
        metrics::record_notifications(targets.len(), notification.kind());
        self.broadcaster.broadcast(node_id, notification, targets);
    }

    /// Mirror a change to the other cluster members, when clustered.
    pub fn send_cluster_task(&self, task: ClusterTask) {
        if self.is_clustering_enabled() {
            self.cluster.do_cluster_task(task);
        }
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    pub fn node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn root_node(&self) -> Option<Arc<Node>> {
        self.node(ROOT_NODE_ID)
    }

    /// Every registered node.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Register a node. Returns `false` when the id is taken.
    pub(crate) fn register(&self, node: Arc<Node>) -> bool {
        let registered = match self.nodes.entry(node.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(node);
                true
            }
        };
        if registered {
            metrics::record_node_count(self.nodes.len(), &self.config.service_id);
        }
        registered
    }

    pub(crate) fn unregister(&self, node_id: &str) -> Option<Arc<Node>> {
        let removed = self.nodes.remove(node_id).map(|(_, node)| node);
        metrics::record_node_count(self.nodes.len(), &self.config.service_id);
        removed
    }

    /// Collections above a node, nearest first, with their distance from
    /// it (1 for the direct parent). `parent` is the node's parent id.
    ///
    /// Takes one node lock at a time.
    pub async fn ancestors(&self, parent: Option<&str>) -> Vec<(usize, Arc<Node>)> {
        let mut ancestors = Vec::new();
        let mut seen = HashSet::new();
        let mut next = parent.map(str::to_string);
        while let Some(id) = next.take() {
            if !seen.insert(id.clone()) {
                warn!(node = %id, "Cycle in collection hierarchy");
                break;
            }
            let Some(node) = self.node(&id) else {
                break;
            };
            next = node.read().await.core().parent().map(str::to_string);
            ancestors.push((ancestors.len() + 1, node));
        }
        ancestors
    }

    // ------------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------------

    /// Flush pending item writes, first on every cluster member when asked.
    pub async fn flush_pending_items(&self, send_to_cluster: bool) -> Result<usize, PersistenceError> {
        if send_to_cluster && self.is_clustering_enabled() {
            self.cluster
                .do_synchronous_cluster_task(ClusterTask::FlushPendingItems {
                    service_id: self.config.service_id.clone(),
                })
                .await;
        }
        self.item_queue.flush(self.persistence.as_ref()).await
    }

    /// Trim stored items of persisting leaves to their retention limit.
    pub async fn purge_stored_items(&self) {
        let mut purged = 0;
        for node in self.nodes() {
            let keep = {
                let state = node.read().await;
                if state.core().deleted {
                    continue;
                }
                state
                    .kind()
                    .as_leaf()
                    .filter(|leaf| leaf.config().persist_items)
                    .and_then(|leaf| leaf.config().effective_max_items())
            };
            let Some(keep) = keep else {
                continue;
            };
            purged += log_failure(
                self.persistence.purge_items_beyond(node.id(), keep).await,
                "purge_items_beyond",
                node.id(),
            )
            .unwrap_or(0);
        }
        if purged > 0 {
            debug!(service = %self.config.service_id, purged, "Purged stored items beyond retention");
        }
    }

    // ------------------------------------------------------------------------
    // Presence and delivery feedback
    // ------------------------------------------------------------------------

    /// A resource of `jid` became available. Leaves that deliver only to
    /// available entities send it their last published item.
    pub async fn presence_available(&self, jid: &Jid) {
        let bare = jid.to_bare();
        for node in self.nodes() {
            if node.is_collection() {
                continue;
            }
            let state = node.read().await;
            if state.ensure_live().is_err()
                || !state.core().config().presence_based_delivery
                || !state.kind().is_send_item_subscribe()
            {
                continue;
            }
            let subscriptions: Vec<_> = state
                .core()
                .subscriptions_of(&bare)
                .into_iter()
                .filter(|s| s.jid() == jid || s.jid().resource().is_none())
                .cloned()
                .collect();
            for subscription in subscriptions {
                state.send_last_published_item(self, &subscription);
            }
        }
    }

    /// A notification to `jid` bounced: cancel every subscription delivered
    /// there. Returns the number cancelled.
    pub async fn handle_delivery_failure(&self, jid: &Jid) -> usize {
        let mut cancelled = 0;
        for node in self.nodes() {
            let mut state = node.write().await;
            if state.ensure_live().is_err() {
                continue;
            }
            let ids: Vec<String> = state
                .core()
                .subscriptions()
                .filter(|s| s.jid() == jid)
                .map(|s| s.id().to_string())
                .collect();
            for id in ids {
                if state.cancel_subscription(self, &id, true).await.is_some() {
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            info!(jid = %jid, cancelled, "Cancelled subscriptions after delivery failure");
        }
        cancelled
    }

    // ------------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------------

    /// Apply a task received from a peer. Memory only: the sending member
    /// persisted the change and notified subscribers.
    pub async fn apply_cluster_task(&self, task: ClusterTask) {
        if task.service_id() != self.config.service_id {
            warn!(task = task.name(), service = %task.service_id(), "Cluster task for another service");
            return;
        }
        if let ClusterTask::FlushPendingItems { .. } = task {
            log_failure(
                self.item_queue.flush(self.persistence.as_ref()).await,
                "flush_pending_items",
                ROOT_NODE_ID,
            );
            return;
        }
        let Some(node) = task.node_id().and_then(|id| self.node(id)) else {
            warn!(task = task.name(), node = ?task.node_id(), "Cluster task for unknown node");
            return;
        };
        debug!(task = task.name(), node = %node.id(), "Applying cluster task");

        match task {
            ClusterTask::AffiliationChanged {
                jid, affiliation, ..
            } => {
                let mut state = node.write().await;
                state
                    .core
                    .affiliates
                    .entry(jid.clone())
                    .and_modify(|a| a.set_affiliation(affiliation))
                    .or_insert_with(|| NodeAffiliate::new(jid, affiliation));
            }
            ClusterTask::NewSubscription { subscription, .. }
            | ClusterTask::ModifySubscription { subscription, .. } => {
                let mut state = node.write().await;
                state.core.take_subscription(subscription.id());
                state.core.insert_subscription(subscription);
            }
            ClusterTask::CancelSubscription {
                subscription_id, ..
            } => {
                let mut state = node.write().await;
                if let Some(subscription) = state.core.take_subscription(&subscription_id) {
                    let owner = subscription.owner().clone();
                    let orphaned = state.core.subscriptions_of(&owner).is_empty()
                        && state
                            .core
                            .affiliate(&owner)
                            .is_some_and(|a| a.affiliation() == Affiliation::None);
                    if orphaned {
                        state.core.affiliates.remove(&owner);
                    }
                }
            }
            ClusterTask::RemoveNode { node_id, .. } => {
                let parent = {
                    let mut state = node.write().await;
                    state.core.deleted = true;
                    state.core.parent().map(str::to_string)
                };
                self.unregister(&node_id);
                if let Some(parent) = parent.and_then(|id| self.node(&id)) {
                    if let Some(collection) = parent.write().await.kind.as_collection_mut() {
                        collection.remove_child(&node_id);
                    }
                }
            }
            ClusterTask::FlushPendingItems { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ChannelBroadcaster;

    async fn service_with(config: ServiceConfig) -> Arc<PubSubService> {
        let (broadcaster, _rx) = ChannelBroadcaster::new();
        PubSubService::new(config, ServicePorts::in_memory(Arc::new(broadcaster)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_node_created() {
        let service = service_with(ServiceConfig::default()).await;
        let root = service.root_node().expect("root exists");
        assert!(root.is_collection());
        let state = root.read().await;
        assert!(state.core().is_saved());
        assert_eq!(
            state.core().owners(),
            vec!["pubsub.localhost".parse::<BareJid>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_admin_checks() {
        let config = ServiceConfig {
            sysadmins: vec!["admin@example.com".parse().unwrap()],
            allowed_to_create: vec!["trusted@example.com".parse().unwrap()],
            node_creation_restricted: true,
            ..ServiceConfig::default()
        };
        let service = service_with(config).await;
        let admin: Jid = "admin@example.com/laptop".parse().unwrap();
        let trusted: Jid = "trusted@example.com".parse().unwrap();
        let user: Jid = "user@example.com".parse().unwrap();
        assert!(service.is_service_admin(&admin));
        assert!(service.can_create_node(&trusted));
        assert!(!service.can_create_node(&user));
    }

    #[tokio::test]
    async fn test_availability_follows_seniority() {
        let service = service_with(ServiceConfig::default()).await;
        assert!(service.is_available());
        service.set_clustering_enabled(true);
        service.set_senior_member(false);
        assert!(!service.is_available());
        service.set_senior_member(true);
        assert!(service.is_available());
        service.shutdown().await;
        assert!(!service.is_available());
    }

    #[tokio::test]
    async fn test_cluster_task_for_other_service_ignored() {
        let service = service_with(ServiceConfig::default()).await;
        service
            .apply_cluster_task(ClusterTask::RemoveNode {
                service_id: "elsewhere".into(),
                node_id: ROOT_NODE_ID.into(),
            })
            .await;
        assert!(service.root_node().is_some());
    }

    #[tokio::test]
    async fn test_default_configurations_persisted() {
        let store = Arc::new(InMemoryPersistence::new());
        let (broadcaster, _rx) = ChannelBroadcaster::new();
        let ports = ServicePorts {
            persistence: store.clone(),
            ..ServicePorts::in_memory(Arc::new(broadcaster))
        };
        let _service = PubSubService::new(ServiceConfig::default(), ports).await.unwrap();
        let leaf = store
            .load_default_configuration(NodeType::Leaf)
            .await
            .unwrap()
            .expect("leaf defaults stored");
        assert_eq!(leaf, DefaultNodeConfiguration::leaf());
        assert_eq!(store.node_count(), 1, "root node persisted");
    }
}

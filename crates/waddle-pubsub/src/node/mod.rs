//! PubSub nodes.
//!
//! A [`Node`] is a shared handle around a lock-protected [`NodeState`]. The
//! state splits into fields common to every node ([`NodeCore`]) and the
//! type-specific part ([`NodeKind`]): a [`LeafNode`] with its items, or a
//! [`CollectionNode`] with its children.
//!
//! Every mutation of a node happens under its write lock. Operations that
//! touch several nodes (ancestor fan-out, reparenting) take one node lock at
//! a time and never nest them.

mod affiliate;
mod collection;
pub mod config;
mod fanout;
pub mod item_store;
mod leaf;
mod membership;
mod publishing;
pub mod subscription;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

pub use affiliate::NodeAffiliate;
pub use collection::CollectionNode;
pub use config::{CollectionConfig, DefaultNodeConfiguration, LeafConfig, NodeConfig};
pub(crate) use fanout::Fanout;
pub use leaf::LeafNode;
pub use subscription::{NodeSubscription, SubscriptionOptions};
pub(crate) use subscription::DeliveryContext;

use crate::error::PubSubError;
use crate::form::{DataForm, FormField, FormType};
use crate::item::{PublishedItem, StoredItem};
use crate::persistence::{log_failure, NodeSnapshot, StoredNode};
use crate::ports::Notification;
use crate::service::PubSubService;
use crate::types::{Affiliation, NodeType};

use self::config::{fields, NODE_CONFIG_NS};

/// Id of the root collection node.
pub const ROOT_NODE_ID: &str = "";

/// Shared handle to a node.
#[derive(Debug)]
pub struct Node {
    id: String,
    node_type: NodeType,
    state: RwLock<NodeState>,
}

impl Node {
    /// Create an unsaved node from the service defaults for its type.
    pub(crate) fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        parent: Option<String>,
        creator: Jid,
        defaults: &DefaultNodeConfiguration,
    ) -> Arc<Node> {
        let id = id.into();
        let service_id = service_id.into();
        let now = Utc::now();
        let kind = match defaults.node_type {
            NodeType::Leaf => NodeKind::Leaf(LeafNode::new(defaults.leaf.clone().unwrap_or_default())),
            NodeType::Collection => NodeKind::Collection(CollectionNode::new(
                defaults.collection.clone().unwrap_or_default(),
            )),
        };
        Arc::new_cyclic(|handle| Node {
            id: id.clone(),
            node_type: defaults.node_type,
            state: RwLock::new(NodeState {
                core: NodeCore {
                    handle: handle.clone(),
                    id,
                    service_id,
                    node_type: defaults.node_type,
                    parent,
                    creator,
                    created_at: now,
                    modified_at: now,
                    config: defaults.config.clone(),
                    affiliates: HashMap::new(),
                    subscriptions: HashMap::new(),
                    subscriptions_by_jid: HashMap::new(),
                    saved: false,
                    deleted: false,
                },
                kind,
            }),
        })
    }

    /// Rebuild a persisted node with its affiliations, subscriptions and items.
    /// Children are linked by the caller once every node exists.
    pub(crate) fn restore(stored: StoredNode, items: Vec<StoredItem>) -> Arc<Node> {
        let StoredNode {
            node,
            affiliates,
            subscriptions,
        } = stored;
        let kind = match node.node_type {
            NodeType::Leaf => NodeKind::Leaf(LeafNode::new(node.leaf.unwrap_or_default())),
            NodeType::Collection => {
                NodeKind::Collection(CollectionNode::new(node.collection.unwrap_or_default()))
            }
        };
        Arc::new_cyclic(|handle: &Weak<Node>| {
            let mut core = NodeCore {
                handle: handle.clone(),
                id: node.node_id.clone(),
                service_id: node.service_id,
                node_type: node.node_type,
                parent: node.parent,
                creator: node.creator,
                created_at: node.created_at,
                modified_at: node.modified_at,
                config: node.config,
                affiliates: HashMap::new(),
                subscriptions: HashMap::new(),
                subscriptions_by_jid: HashMap::new(),
                saved: true,
                deleted: false,
            };
            for affiliate in affiliates {
                core.affiliates.insert(affiliate.jid().clone(), affiliate);
            }
            for subscription in subscriptions {
                core.insert_subscription(subscription);
            }
            let mut kind = kind;
            if let NodeKind::Leaf(leaf) = &mut kind {
                let max = leaf.config.effective_max_items();
                for stored in items {
                    let item = Arc::new(PublishedItem::from_stored(handle.clone(), stored));
                    leaf.items.insert(item, max);
                }
            }
            Node {
                id: node.node_id,
                node_type: node.node_type,
                state: RwLock::new(NodeState { core, kind }),
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_collection(&self) -> bool {
        self.node_type == NodeType::Collection
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_NODE_ID
    }

    /// Acquire the node state for reading.
    pub async fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().await
    }
}

/// Fields shared by every node type.
#[derive(Debug)]
pub struct NodeCore {
    pub(crate) handle: Weak<Node>,
    pub(crate) id: String,
    pub(crate) service_id: String,
    pub(crate) node_type: NodeType,
    pub(crate) parent: Option<String>,
    pub(crate) creator: Jid,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) modified_at: DateTime<Utc>,
    pub(crate) config: NodeConfig,
    pub(crate) affiliates: HashMap<BareJid, NodeAffiliate>,
    /// Authoritative subscription table, keyed by subscription id.
    pub(crate) subscriptions: HashMap<String, NodeSubscription>,
    /// Delivery JID to subscription id.
    pub(crate) subscriptions_by_jid: HashMap<Jid, String>,
    pub(crate) saved: bool,
    pub(crate) deleted: bool,
}

impl NodeCore {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_collection(&self) -> bool {
        self.node_type == NodeType::Collection
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_NODE_ID
    }

    /// Id of the parent collection; `None` only for the root.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn creator(&self) -> &Jid {
        &self.creator
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Whether the node was written to persistence.
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn affiliate(&self, jid: &BareJid) -> Option<&NodeAffiliate> {
        self.affiliates.get(jid)
    }

    pub fn affiliates(&self) -> impl Iterator<Item = &NodeAffiliate> {
        self.affiliates.values()
    }

    fn with_affiliation(&self, affiliation: Affiliation) -> Vec<BareJid> {
        self.affiliates
            .values()
            .filter(|a| a.affiliation() == affiliation)
            .map(|a| a.jid().clone())
            .collect()
    }

    pub fn owners(&self) -> Vec<BareJid> {
        self.with_affiliation(Affiliation::Owner)
    }

    pub fn publishers(&self) -> Vec<BareJid> {
        self.with_affiliation(Affiliation::Publisher)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &NodeSubscription> {
        self.subscriptions.values()
    }

    pub fn subscription(&self, id: &str) -> Option<&NodeSubscription> {
        self.subscriptions.get(id)
    }

    /// Subscription delivered to `jid`. Meaningful when an entity holds at
    /// most one subscription per delivery JID.
    pub fn subscription_by_jid(&self, jid: &Jid) -> Option<&NodeSubscription> {
        self.subscriptions_by_jid
            .get(jid)
            .and_then(|id| self.subscriptions.get(id))
    }

    /// Subscriptions owned by an entity.
    pub fn subscriptions_of(&self, owner: &BareJid) -> Vec<&NodeSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.owner() == owner)
            .collect()
    }

    pub fn pending_subscriptions(&self) -> Vec<&NodeSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.is_authorization_pending())
            .collect()
    }

    /// Owners of the node and service admins.
    pub fn is_admin(&self, service: &PubSubService, jid: &Jid) -> bool {
        let owner = self
            .affiliates
            .get(&jid.to_bare())
            .is_some_and(|a| a.affiliation() == Affiliation::Owner);
        owner || service.is_service_admin(jid)
    }

    /// Whether the node needs the presence of `user`: the user holds a
    /// subscription and either the node delivers by presence or one of the
    /// user's subscriptions filters on show values.
    pub fn is_presence_based_delivery(&self, user: &BareJid) -> bool {
        let subscriptions = self.subscriptions_of(user);
        !subscriptions.is_empty()
            && (self.config.presence_based_delivery
                || subscriptions
                    .iter()
                    .any(|s| !s.options().show_values.is_empty()))
    }

    pub(crate) fn delivery_context<'a>(
        &self,
        service: &'a PubSubService,
        collection_distance: Option<usize>,
    ) -> DeliveryContext<'a> {
        DeliveryContext {
            presence: service.presence(),
            presence_based_delivery: self.config.presence_based_delivery,
            collection_distance,
        }
    }

    /// Register a subscription in both lookup tables. The owner gets a
    /// `none` affiliation if it has none.
    pub(crate) fn insert_subscription(&mut self, subscription: NodeSubscription) {
        let owner = subscription.owner().clone();
        self.affiliates
            .entry(owner.clone())
            .or_insert_with(|| NodeAffiliate::new(owner, Affiliation::None));
        self.subscriptions_by_jid
            .insert(subscription.jid().clone(), subscription.id().to_string());
        self.subscriptions
            .insert(subscription.id().to_string(), subscription);
    }

    /// Remove a subscription from both lookup tables.
    pub(crate) fn take_subscription(&mut self, id: &str) -> Option<NodeSubscription> {
        let subscription = self.subscriptions.remove(id)?;
        let jid = subscription.jid();
        if self.subscriptions_by_jid.get(jid).is_some_and(|s| s == id) {
            self.subscriptions_by_jid.remove(jid);
            if let Some(other) = self.subscriptions.values().find(|s| s.jid() == jid) {
                self.subscriptions_by_jid
                    .insert(jid.clone(), other.id().to_string());
            }
        }
        Some(subscription)
    }

    /// Distinct delivery JIDs of subscriptions eligible for node events.
    pub(crate) fn node_event_targets(&self, service: &PubSubService, include_all: bool) -> Vec<Jid> {
        let ctx = self.delivery_context(service, None);
        let mut targets: Vec<Jid> = Vec::new();
        for subscription in self.subscriptions.values() {
            if (include_all || subscription.can_send_node_events(&ctx))
                && !targets.contains(subscription.jid())
            {
                targets.push(subscription.jid().clone());
            }
        }
        targets
    }
}

/// Type-specific behavior of a node.
pub trait NodeHooks {
    /// Configuration owned by the node type.
    type Config: Clone;

    fn node_type(&self) -> NodeType;

    fn config(&self) -> &Self::Config;

    fn set_config(&mut self, config: Self::Config);

    /// Apply a submitted field to a staged configuration. `Ok(false)` when
    /// the field is not recognized.
    fn configure_field(
        config: &mut Self::Config,
        field: &FormField,
        outcome: &mut ConfigureOutcome,
    ) -> Result<bool, PubSubError>;

    /// Runs after a configuration is committed. Returns evicted items.
    fn post_configure(&mut self) -> Vec<Arc<PublishedItem>>;

    /// Runs when the node is deleted. Returns the ids of orphaned children.
    fn deleting_node(&mut self) -> Vec<String>;

    fn write_form(&self, form: &mut DataForm);

    fn published_item(&self, _id: &str) -> Option<Arc<PublishedItem>> {
        None
    }

    fn published_items(&self, _max: Option<usize>) -> Vec<Arc<PublishedItem>> {
        Vec::new()
    }

    fn last_published_item(&self) -> Option<Arc<PublishedItem>> {
        None
    }
}

/// Side results of a configuration change.
#[derive(Debug, Default)]
pub struct ConfigureOutcome {
    /// Requested child list of a collection.
    pub children: Option<Vec<String>>,
    /// Items evicted by a lower retention limit.
    pub evicted: Vec<Arc<PublishedItem>>,
}

/// Fields handled by the node itself rather than by the configuration structs.
fn is_structural_field(var: &str) -> bool {
    matches!(
        var,
        "FORM_TYPE" | fields::OWNER | fields::PUBLISHER | fields::NODE_TYPE | fields::COLLECTION
    )
}

/// Apply every field to staged copies of the configuration.
fn stage_fields<H: NodeHooks>(
    hooks: &H,
    common: &NodeConfig,
    form: &DataForm,
) -> Result<(NodeConfig, H::Config, ConfigureOutcome), PubSubError> {
    let mut staged_common = common.clone();
    let mut staged = hooks.config().clone();
    let mut outcome = ConfigureOutcome::default();
    for field in form.fields.iter().filter(|f| !is_structural_field(&f.var)) {
        if !staged_common.apply_field(field)? && !H::configure_field(&mut staged, field, &mut outcome)? {
            debug!(field = %field.var, "Ignoring unknown configuration field");
        }
    }
    Ok((staged_common, staged, outcome))
}

/// Validate every field against staged copies, then commit them together.
fn stage_form<H: NodeHooks>(
    hooks: &mut H,
    common: &mut NodeConfig,
    form: &DataForm,
) -> Result<ConfigureOutcome, PubSubError> {
    let (staged_common, staged, outcome) = stage_fields(&*hooks, common, form)?;
    *common = staged_common;
    hooks.set_config(staged);
    Ok(outcome)
}

/// Owner and publisher lists named by a submitted form.
fn affiliation_lists(
    form: &DataForm,
) -> Result<(Option<Vec<BareJid>>, Option<Vec<BareJid>>), PubSubError> {
    let owners = form.field(fields::OWNER).map(parse_bare_jids).transpose()?;
    if owners.as_ref().is_some_and(Vec::is_empty) {
        return Err(PubSubError::not_acceptable(
            "node must keep at least one owner",
        ));
    }
    let publishers = form
        .field(fields::PUBLISHER)
        .map(parse_bare_jids)
        .transpose()?;
    Ok((owners, publishers))
}

/// The type-specific part of a node.
#[derive(Debug)]
pub enum NodeKind {
    Leaf(LeafNode),
    Collection(CollectionNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Leaf(leaf) => leaf.node_type(),
            NodeKind::Collection(collection) => collection.node_type(),
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            NodeKind::Leaf(leaf) => Some(leaf),
            NodeKind::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionNode> {
        match self {
            NodeKind::Collection(collection) => Some(collection),
            NodeKind::Leaf(_) => None,
        }
    }

    pub(crate) fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match self {
            NodeKind::Leaf(leaf) => Some(leaf),
            NodeKind::Collection(_) => None,
        }
    }

    pub(crate) fn as_collection_mut(&mut self) -> Option<&mut CollectionNode> {
        match self {
            NodeKind::Collection(collection) => Some(collection),
            NodeKind::Leaf(_) => None,
        }
    }

    fn configure(
        &mut self,
        common: &mut NodeConfig,
        form: &DataForm,
    ) -> Result<ConfigureOutcome, PubSubError> {
        match self {
            NodeKind::Leaf(leaf) => stage_form(leaf, common, form),
            NodeKind::Collection(collection) => stage_form(collection, common, form),
        }
    }

    fn validate(&self, common: &NodeConfig, form: &DataForm) -> Result<(), PubSubError> {
        match self {
            NodeKind::Leaf(leaf) => stage_fields(leaf, common, form).map(drop),
            NodeKind::Collection(collection) => stage_fields(collection, common, form).map(drop),
        }
    }

    fn post_configure(&mut self) -> Vec<Arc<PublishedItem>> {
        match self {
            NodeKind::Leaf(leaf) => leaf.post_configure(),
            NodeKind::Collection(collection) => collection.post_configure(),
        }
    }

    pub(crate) fn deleting_node(&mut self) -> Vec<String> {
        match self {
            NodeKind::Leaf(leaf) => leaf.deleting_node(),
            NodeKind::Collection(collection) => collection.deleting_node(),
        }
    }

    fn write_form(&self, form: &mut DataForm) {
        match self {
            NodeKind::Leaf(leaf) => NodeHooks::write_form(leaf, form),
            NodeKind::Collection(collection) => NodeHooks::write_form(collection, form),
        }
    }

    pub fn published_item(&self, id: &str) -> Option<Arc<PublishedItem>> {
        match self {
            NodeKind::Leaf(leaf) => leaf.published_item(id),
            NodeKind::Collection(collection) => collection.published_item(id),
        }
    }

    pub fn published_items(&self, max: Option<usize>) -> Vec<Arc<PublishedItem>> {
        match self {
            NodeKind::Leaf(leaf) => leaf.published_items(max),
            NodeKind::Collection(collection) => collection.published_items(max),
        }
    }

    pub fn last_published_item(&self) -> Option<Arc<PublishedItem>> {
        match self {
            NodeKind::Leaf(leaf) => leaf.last_published_item(),
            NodeKind::Collection(collection) => collection.last_published_item(),
        }
    }

    /// Whether publications must carry items.
    pub fn is_item_required(&self, deliver_payloads: bool) -> bool {
        match self {
            NodeKind::Leaf(leaf) => leaf.is_item_required(deliver_payloads),
            NodeKind::Collection(_) => false,
        }
    }

    pub fn is_send_item_subscribe(&self) -> bool {
        match self {
            NodeKind::Leaf(leaf) => leaf.config.send_item_subscribe,
            NodeKind::Collection(_) => false,
        }
    }
}

/// Lock-protected state of a node.
#[derive(Debug)]
pub struct NodeState {
    pub(crate) core: NodeCore,
    pub(crate) kind: NodeKind,
}

impl NodeState {
    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub(crate) fn ensure_live(&self) -> Result<(), PubSubError> {
        if self.core.deleted {
            Err(PubSubError::NodeNotFound(self.core.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Detach the node before deletion: subscribers are told (when enabled),
    /// presence requirements are released and memberships dropped. Returns
    /// the ids of the children left without a parent.
    pub(crate) async fn tear_down(&mut self, service: &PubSubService) -> Vec<String> {
        if self.core.config.notify_delete {
            let targets = self.core.node_event_targets(service, true);
            service.broadcast(
                &self.core.id,
                Notification::Delete {
                    node_id: self.core.id.clone(),
                },
                &targets,
            );
        }
        service
            .presence_tracker()
            .release_node(service.presence(), &self.core.id);
        service.item_queue().discard_node(&self.core.id).await;
        self.core.deleted = true;
        self.core.subscriptions.clear();
        self.core.subscriptions_by_jid.clear();
        self.core.affiliates.clear();
        self.kind.deleting_node()
    }

    /// Current configuration as a `pubsub#node_config` form.
    pub fn configuration_form(&self) -> DataForm {
        let mut form = DataForm::new(FormType::Form).with_namespace(NODE_CONFIG_NS);
        form.add_field(fields::NODE_TYPE, [self.core.node_type.to_string()]);
        form.add_field(fields::COLLECTION, self.core.parent.clone());
        self.core.config.write_form(&mut form);
        self.kind.write_form(&mut form);
        form.add_field(
            fields::OWNER,
            self.core.owners().iter().map(|j| j.to_string()),
        );
        form.add_field(
            fields::PUBLISHER,
            self.core.publishers().iter().map(|j| j.to_string()),
        );
        form
    }

    /// Persistent form of the node metadata and configuration.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.core.id.clone(),
            service_id: self.core.service_id.clone(),
            node_type: self.core.node_type,
            parent: self.core.parent.clone(),
            creator: self.core.creator.clone(),
            created_at: self.core.created_at,
            modified_at: self.core.modified_at,
            config: self.core.config.clone(),
            leaf: self.kind.as_leaf().map(|l| l.config.clone()),
            collection: self.kind.as_collection().map(|c| c.config.clone()),
        }
    }

    /// Check a configuration form without applying it.
    pub(crate) fn validate_form(&self, form: &DataForm) -> Result<(), PubSubError> {
        if form.form_type != FormType::Submit {
            return Ok(());
        }
        affiliation_lists(form)?;
        self.kind.validate(&self.core.config, form)
    }

    /// Apply a node configuration form.
    ///
    /// A cancelled form changes nothing. Every field is validated before
    /// anything is committed. The collection `children` field is returned
    /// in the outcome for the caller to apply, since it touches other nodes.
    pub(crate) async fn configure(
        &mut self,
        service: &PubSubService,
        form: &DataForm,
    ) -> Result<ConfigureOutcome, PubSubError> {
        if form.form_type != FormType::Submit {
            return Ok(ConfigureOutcome::default());
        }
        let (owners, publishers) = affiliation_lists(form)?;

        let mut outcome = self.kind.configure(&mut self.core.config, form)?;
        outcome.evicted = self.kind.post_configure();
        for item in &outcome.evicted {
            service.item_queue().delete(item.key()).await;
        }

        if let Some(owners) = owners {
            for old in self.core.owners() {
                if !owners.contains(&old) {
                    self.remove_owner(service, &old).await;
                }
            }
            for owner in &owners {
                self.add_owner(service, owner).await;
            }
        }
        if let Some(publishers) = publishers {
            for old in self.core.publishers() {
                if !publishers.contains(&old) {
                    self.remove_publisher(service, &old).await;
                }
            }
            for publisher in &publishers {
                self.add_publisher(service, publisher).await;
            }
        }

        self.core.modified_at = Utc::now();
        if self.core.saved {
            self.notify_configuration_changed(service);
            self.save(service).await;
        }
        self.sync_all_presence(service);
        debug!(node = %self.core.id, "Node configured");
        Ok(outcome)
    }

    /// Write the node to persistence: insert with its affiliations and
    /// subscriptions the first time, update afterwards.
    pub(crate) async fn save(&mut self, service: &PubSubService) {
        let snapshot = self.snapshot();
        let store = service.persistence();
        if self.core.saved {
            log_failure(store.update_node(&snapshot).await, "update_node", &self.core.id);
            return;
        }
        if log_failure(store.create_node(&snapshot).await, "create_node", &self.core.id).is_none() {
            return;
        }
        for affiliate in self.core.affiliates.values() {
            log_failure(
                store.create_affiliation(&self.core.id, affiliate).await,
                "create_affiliation",
                &self.core.id,
            );
        }
        for subscription in self.core.subscriptions.values() {
            log_failure(
                store.create_subscription(&self.core.id, subscription).await,
                "create_subscription",
                &self.core.id,
            );
        }
        self.core.saved = true;
    }

    pub(crate) fn notify_configuration_changed(&self, service: &PubSubService) {
        if !self.core.config.notify_config_changes {
            return;
        }
        let form = self
            .core
            .config
            .deliver_payloads
            .then(|| self.configuration_form());
        let notification = Notification::Configuration {
            node_id: self.core.id.clone(),
            form,
        };
        let targets = self.core.node_event_targets(service, false);
        service.broadcast(&self.core.id, notification, &targets);
    }

    /// Re-evaluate whether this node needs the presence of `user`.
    pub(crate) fn sync_presence(&self, service: &PubSubService, user: &BareJid) {
        service.presence_tracker().set_required(
            service.presence(),
            &self.core.id,
            user,
            self.core.is_presence_based_delivery(user),
        );
    }

    fn sync_all_presence(&self, service: &PubSubService) {
        let users: HashSet<&BareJid> = self.core.subscriptions.values().map(|s| s.owner()).collect();
        for user in users {
            self.sync_presence(service, user);
        }
    }
}

/// Parse JID list fields (owner, publisher) into bare JIDs.
fn parse_bare_jids(field: &FormField) -> Result<Vec<BareJid>, PubSubError> {
    let mut jids = Vec::new();
    for jid in config::parse_jids(field)? {
        let bare = jid.to_bare();
        if !jids.contains(&bare) {
            jids.push(bare);
        }
    }
    Ok(jids)
}

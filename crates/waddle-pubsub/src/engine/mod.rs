//! Protocol-level operations.
//!
//! [`PubSubEngine`] holds no state of its own. Each operation validates a
//! typed request against the node, its subscriptions and the access models,
//! applies the change under the node lock and hands the resulting events to
//! the broadcaster. The protocol layer turns stanzas into [`PubSubRequest`]
//! values and renders the [`PubSubResponse`] or [`PubSubError`] it gets back.

mod items;
mod nodes;
mod owner;
pub mod request;
mod subscriptions;

use std::sync::Arc;

use chrono::Utc;
use jid::{BareJid, Jid};
use tracing::debug;

use crate::error::PubSubError;
use crate::form::DataForm;
use crate::node::{Fanout, Node, NodeSubscription, ROOT_NODE_ID};
use crate::ports::{ItemView, Notification};
use crate::service::PubSubService;
use crate::types::{Affiliation, SubscriptionState};

pub use request::*;

/// A request received by the pubsub service.
#[derive(Debug, Clone)]
pub enum PubSubRequest {
    CreateNode(CreateNode),
    ConfigureNode(ConfigureNode),
    DeleteNode(DeleteNode),
    PurgeNode(PurgeNode),
    GetNodeConfiguration(GetNodeConfiguration),
    GetDefaultConfiguration(GetDefaultConfiguration),
    Publish(Publish),
    Retract(Retract),
    GetItems(GetItems),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    GetSubscriptionOptions(GetSubscriptionOptions),
    SetSubscriptionOptions(SetSubscriptionOptions),
    GetSubscriptions(GetSubscriptions),
    GetAffiliations(GetAffiliations),
    GetNodeSubscriptions(GetNodeSubscriptions),
    ModifyNodeSubscriptions(ModifyNodeSubscriptions),
    GetNodeAffiliations(GetNodeAffiliations),
    ModifyNodeAffiliations(ModifyNodeAffiliations),
    AnswerAuthorization(AnswerAuthorization),
    GetPendingSubscriptions(GetPendingSubscriptions),
    DeliveryFailure(DeliveryFailure),
}

impl PubSubRequest {
    /// Action name for logs.
    pub fn action(&self) -> &'static str {
        match self {
            PubSubRequest::CreateNode(_) => "create-node",
            PubSubRequest::ConfigureNode(_) => "configure-node",
            PubSubRequest::DeleteNode(_) => "delete-node",
            PubSubRequest::PurgeNode(_) => "purge-node",
            PubSubRequest::GetNodeConfiguration(_) => "get-node-configuration",
            PubSubRequest::GetDefaultConfiguration(_) => "get-default-configuration",
            PubSubRequest::Publish(_) => "publish-item",
            PubSubRequest::Retract(_) => "retract-item",
            PubSubRequest::GetItems(_) => "get-items",
            PubSubRequest::Subscribe(_) => "subscribe",
            PubSubRequest::Unsubscribe(_) => "unsubscribe",
            PubSubRequest::GetSubscriptionOptions(_) => "get-subscription-options",
            PubSubRequest::SetSubscriptionOptions(_) => "set-subscription-options",
            PubSubRequest::GetSubscriptions(_) => "get-subscriptions",
            PubSubRequest::GetAffiliations(_) => "get-affiliations",
            PubSubRequest::GetNodeSubscriptions(_) => "get-node-subscriptions",
            PubSubRequest::ModifyNodeSubscriptions(_) => "modify-node-subscriptions",
            PubSubRequest::GetNodeAffiliations(_) => "get-node-affiliations",
            PubSubRequest::ModifyNodeAffiliations(_) => "modify-node-affiliations",
            PubSubRequest::AnswerAuthorization(_) => "answer-authorization",
            PubSubRequest::GetPendingSubscriptions(_) => "get-pending-subscriptions",
            PubSubRequest::DeliveryFailure(_) => "delivery-failure",
        }
    }
}

/// One subscription as reported to the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub node_id: String,
    pub jid: Jid,
    pub subscription_id: String,
    pub state: SubscriptionState,
}

impl From<&NodeSubscription> for SubscriptionInfo {
    fn from(subscription: &NodeSubscription) -> Self {
        Self {
            node_id: subscription.node_id().to_string(),
            jid: subscription.jid().clone(),
            subscription_id: subscription.id().to_string(),
            state: subscription.state(),
        }
    }
}

/// One affiliation as reported to the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct AffiliationInfo {
    pub node_id: String,
    pub jid: BareJid,
    pub affiliation: Affiliation,
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubResponse {
    /// Done, nothing to report.
    Success,
    Created { node_id: String },
    Published { node_id: String, item_ids: Vec<String> },
    /// Node configuration, default configuration or subscription options.
    Form(DataForm),
    Items { node_id: String, items: Vec<ItemView> },
    Subscription(SubscriptionInfo),
    Subscriptions(Vec<SubscriptionInfo>),
    Affiliations(Vec<AffiliationInfo>),
    /// Subscriptions cancelled after a delivery failure.
    Cancelled { count: usize },
}

/// Dispatches requests against a [`PubSubService`].
#[derive(Debug, Clone)]
pub struct PubSubEngine {
    service: Arc<PubSubService>,
}

impl PubSubEngine {
    pub fn new(service: Arc<PubSubService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<PubSubService> {
        &self.service
    }

    /// Fail with `ServiceUnavailable` while the service is stopped or is a
    /// non-senior cluster member. Every operation checks this first.
    fn ensure_available(&self) -> Result<(), PubSubError> {
        if self.service.is_available() {
            Ok(())
        } else {
            debug!("Rejecting request, service unavailable");
            Err(PubSubError::ServiceUnavailable)
        }
    }

    /// Run one request.
    pub async fn handle(&self, request: PubSubRequest) -> Result<PubSubResponse, PubSubError> {
        debug!(action = request.action(), "Handling request");
        match request {
            PubSubRequest::CreateNode(req) => self
                .create_node(req)
                .await
                .map(|node_id| PubSubResponse::Created { node_id }),
            PubSubRequest::ConfigureNode(req) => {
                self.configure_node(req).await.map(|_| PubSubResponse::Success)
            }
            PubSubRequest::DeleteNode(req) => {
                self.delete_node(req).await.map(|_| PubSubResponse::Success)
            }
            PubSubRequest::PurgeNode(req) => {
                self.purge_node(req).await.map(|_| PubSubResponse::Success)
            }
            PubSubRequest::GetNodeConfiguration(req) => {
                self.get_node_configuration(req).await.map(PubSubResponse::Form)
            }
            PubSubRequest::GetDefaultConfiguration(req) => {
                self.get_default_configuration(req).map(PubSubResponse::Form)
            }
            PubSubRequest::Publish(req) => {
                let node_id = req.node_id.clone().unwrap_or_default();
                self.publish(req)
                    .await
                    .map(|item_ids| PubSubResponse::Published { node_id, item_ids })
            }
            PubSubRequest::Retract(req) => {
                self.retract(req).await.map(|_| PubSubResponse::Success)
            }
            PubSubRequest::GetItems(req) => {
                let node_id = req.node_id.clone().unwrap_or_default();
                self.get_items(req)
                    .await
                    .map(|items| PubSubResponse::Items { node_id, items })
            }
            PubSubRequest::Subscribe(req) => {
                self.subscribe(req).await.map(PubSubResponse::Subscription)
            }
            PubSubRequest::Unsubscribe(req) => {
                self.unsubscribe(req).await.map(|_| PubSubResponse::Success)
            }
            PubSubRequest::GetSubscriptionOptions(req) => {
                self.get_subscription_options(req).await.map(PubSubResponse::Form)
            }
            PubSubRequest::SetSubscriptionOptions(req) => self
                .set_subscription_options(req)
                .await
                .map(PubSubResponse::Subscription),
            PubSubRequest::GetSubscriptions(req) => {
                self.get_subscriptions(req).await.map(PubSubResponse::Subscriptions)
            }
            PubSubRequest::GetAffiliations(req) => {
                self.get_affiliations(req).await.map(PubSubResponse::Affiliations)
            }
            PubSubRequest::GetNodeSubscriptions(req) => self
                .get_node_subscriptions(req)
                .await
                .map(PubSubResponse::Subscriptions),
            PubSubRequest::ModifyNodeSubscriptions(req) => self
                .modify_node_subscriptions(req)
                .await
                .map(|_| PubSubResponse::Success),
            PubSubRequest::GetNodeAffiliations(req) => self
                .get_node_affiliations(req)
                .await
                .map(PubSubResponse::Affiliations),
            PubSubRequest::ModifyNodeAffiliations(req) => self
                .modify_node_affiliations(req)
                .await
                .map(|_| PubSubResponse::Success),
            PubSubRequest::AnswerAuthorization(req) => self
                .answer_authorization(req)
                .await
                .map(|_| PubSubResponse::Success),
            PubSubRequest::GetPendingSubscriptions(req) => self
                .get_pending_subscriptions(req)
                .await
                .map(PubSubResponse::Subscriptions),
            PubSubRequest::DeliveryFailure(req) => {
                self.ensure_available()?;
                Ok(PubSubResponse::Cancelled {
                    count: self.service.handle_delivery_failure(&req.jid).await,
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// The named node. Missing ids and unknown nodes are errors.
    fn require_node(&self, node_id: Option<&str>) -> Result<Arc<Node>, PubSubError> {
        let node_id = node_id.ok_or(PubSubError::NodeIdRequired)?;
        self.service
            .node(node_id)
            .ok_or_else(|| PubSubError::NodeNotFound(node_id.to_string()))
    }

    /// The named node, or the root collection when no id is given.
    fn node_or_root(&self, node_id: Option<&str>) -> Result<Arc<Node>, PubSubError> {
        let node_id = node_id.unwrap_or(ROOT_NODE_ID);
        self.service
            .node(node_id)
            .ok_or_else(|| PubSubError::NodeNotFound(node_id.to_string()))
    }

    /// Fail unless `from` owns the node or administers the service.
    async fn require_admin(&self, node: &Node, from: &Jid) -> Result<(), PubSubError> {
        let state = node.read().await;
        state.ensure_live()?;
        if state.core().is_admin(&self.service, from) {
            Ok(())
        } else {
            Err(PubSubError::forbidden("requester is not a node owner"))
        }
    }

    // ------------------------------------------------------------------------
    // Collection membership
    // ------------------------------------------------------------------------

    /// Tell the subscribers of `collection` and of its ancestors that a
    /// child was added or removed.
    async fn notify_child_event(&self, collection: &Node, notification: Notification) {
        let mut fanout = Fanout::new();
        let grandparent = {
            let state = collection.read().await;
            if state.ensure_live().is_err() {
                return;
            }
            fanout.add_child_event(state.core(), &self.service, 1);
            state.core().parent().map(str::to_string)
        };
        for (distance, ancestor) in self.service.ancestors(grandparent.as_deref()).await {
            let state = ancestor.read().await;
            if state.ensure_live().is_ok() {
                fanout.add_child_event(state.core(), &self.service, distance + 1);
            }
        }
        let targets = fanout.into_targets();
        self.service.broadcast(collection.id(), notification, &targets);
    }

    async fn attach_child(&self, collection: &Node, child_id: &str) {
        let added = match collection.write().await.kind.as_collection_mut() {
            Some(children) => children.add_child(child_id),
            None => false,
        };
        if added {
            self.notify_child_event(
                collection,
                Notification::NodeAssociated {
                    collection_id: collection.id().to_string(),
                    node_id: child_id.to_string(),
                },
            )
            .await;
        }
    }

    async fn detach_child(&self, collection: &Node, child_id: &str) {
        let removed = match collection.write().await.kind.as_collection_mut() {
            Some(children) => children.remove_child(child_id),
            None => false,
        };
        if removed {
            self.notify_child_event(
                collection,
                Notification::NodeDissociated {
                    collection_id: collection.id().to_string(),
                    node_id: child_id.to_string(),
                },
            )
            .await;
        }
    }

    /// Move `child` under `new_parent`. Node locks are taken one at a time.
    async fn move_node(&self, child: &Node, new_parent: &Node) {
        let old_parent = {
            let mut state = child.write().await;
            if state.ensure_live().is_err() {
                return;
            }
            let old_parent = state.core.parent.replace(new_parent.id().to_string());
            if old_parent.as_deref() != Some(new_parent.id()) {
                state.core.modified_at = Utc::now();
                if state.core.saved {
                    state.save(&self.service).await;
                }
            }
            old_parent
        };
        if let Some(old) = old_parent.as_deref() {
            if old != new_parent.id() {
                if let Some(old) = self.service.node(old) {
                    self.detach_child(&old, child.id()).await;
                }
            }
        }
        self.attach_child(new_parent, child.id()).await;
        debug!(node = %child.id(), parent = %new_parent.id(), "Node moved");
    }

    /// Whether `node_id` is `start` or one of its ancestors.
    async fn is_in_lineage(&self, start: &str, node_id: &str) -> bool {
        self.service
            .ancestors(Some(start))
            .await
            .iter()
            .any(|(_, node)| node.id() == node_id)
    }
}

//! Typed engine requests, one struct per action.
//!
//! `from` is always the requesting entity as authenticated by the protocol
//! layer. `node_id: None` means the request did not name a node.

use jid::{BareJid, Jid};

use crate::form::DataForm;
use crate::item::NewItem;
use crate::types::{Affiliation, NodeType, SubscriptionState};

#[derive(Debug, Clone)]
pub struct CreateNode {
    pub from: Jid,
    /// `None` asks for an instant node with a generated id.
    pub node_id: Option<String>,
    /// Initial configuration, including `pubsub#collection` and
    /// `pubsub#node_type`.
    pub form: Option<DataForm>,
}

#[derive(Debug, Clone)]
pub struct ConfigureNode {
    pub from: Jid,
    pub node_id: Option<String>,
    pub form: DataForm,
}

#[derive(Debug, Clone)]
pub struct DeleteNode {
    pub from: Jid,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PurgeNode {
    pub from: Jid,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GetNodeConfiguration {
    pub from: Jid,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GetDefaultConfiguration {
    pub node_type: NodeType,
}

#[derive(Debug, Clone)]
pub struct Publish {
    pub from: Jid,
    pub node_id: Option<String>,
    pub items: Vec<NewItem>,
}

#[derive(Debug, Clone)]
pub struct Retract {
    pub from: Jid,
    pub node_id: Option<String>,
    pub item_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GetItems {
    pub from: Jid,
    pub node_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Only the most recent items.
    pub max_items: Option<usize>,
    /// Specific items. Ignored when `max_items` is set.
    pub item_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub from: Jid,
    /// `None` subscribes to the root collection.
    pub node_id: Option<String>,
    pub jid: Option<Jid>,
    pub options: Option<DataForm>,
}

#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub from: Jid,
    pub node_id: Option<String>,
    pub jid: Option<Jid>,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GetSubscriptionOptions {
    pub from: Jid,
    pub node_id: Option<String>,
    pub jid: Option<Jid>,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SetSubscriptionOptions {
    pub from: Jid,
    pub node_id: Option<String>,
    pub jid: Option<Jid>,
    pub subscription_id: Option<String>,
    pub form: Option<DataForm>,
}

/// Subscriptions of the requester, optionally limited to one node.
#[derive(Debug, Clone)]
pub struct GetSubscriptions {
    pub from: Jid,
    pub node_id: Option<String>,
}

/// Affiliations of the requester, optionally limited to one node.
#[derive(Debug, Clone)]
pub struct GetAffiliations {
    pub from: Jid,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GetNodeSubscriptions {
    pub from: Jid,
    pub node_id: Option<String>,
}

/// One entry of a modify-node-subscriptions request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionChange {
    pub jid: Jid,
    pub state: SubscriptionState,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModifyNodeSubscriptions {
    pub from: Jid,
    pub node_id: Option<String>,
    pub changes: Vec<SubscriptionChange>,
}

#[derive(Debug, Clone)]
pub struct GetNodeAffiliations {
    pub from: Jid,
    pub node_id: Option<String>,
}

/// One entry of a modify-node-affiliations request.
#[derive(Debug, Clone, PartialEq)]
pub struct AffiliationChange {
    pub jid: BareJid,
    pub affiliation: Affiliation,
}

#[derive(Debug, Clone)]
pub struct ModifyNodeAffiliations {
    pub from: Jid,
    pub node_id: Option<String>,
    pub changes: Vec<AffiliationChange>,
}

/// An owner's answer to an authorization request.
#[derive(Debug, Clone)]
pub struct AnswerAuthorization {
    pub from: Jid,
    pub node_id: String,
    pub subscription_id: String,
    pub allow: bool,
}

/// Pending subscriptions of every node the requester owns.
#[derive(Debug, Clone)]
pub struct GetPendingSubscriptions {
    pub from: Jid,
}

/// A notification to `jid` bounced with a cancel-type error.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub jid: Jid,
}

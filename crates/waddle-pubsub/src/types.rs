//! Common types for the pubsub engine.

use serde::{Deserialize, Serialize};

/// Node affiliation levels (XEP-0060 Section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Banned from the node
    Outcast,
    /// No affiliation, may still hold subscriptions
    None,
    /// May publish items
    Publisher,
    /// Full control over the node
    Owner,
}

impl Affiliation {
    /// Parse an affiliation from its attribute value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "outcast" => Some(Affiliation::Outcast),
            "none" | "member" => Some(Affiliation::None),
            "publisher" => Some(Affiliation::Publisher),
            "owner" => Some(Affiliation::Owner),
            _ => None,
        }
    }

    /// Owners and publishers may publish under the `publishers` model.
    pub fn can_publish(&self) -> bool {
        matches!(self, Affiliation::Owner | Affiliation::Publisher)
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affiliation::Outcast => write!(f, "outcast"),
            Affiliation::None => write!(f, "none"),
            Affiliation::Publisher => write!(f, "publisher"),
            Affiliation::Owner => write!(f, "owner"),
        }
    }
}

/// Subscription state (XEP-0060 Section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Never receives notifications
    None,
    /// Awaiting owner approval
    Pending,
    /// Awaiting subscriber configuration
    Unconfigured,
    /// Receives notifications
    Subscribed,
}

impl SubscriptionState {
    /// Parse a subscription state from its attribute value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SubscriptionState::None),
            "pending" => Some(SubscriptionState::Pending),
            "unconfigured" => Some(SubscriptionState::Unconfigured),
            "subscribed" => Some(SubscriptionState::Subscribed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionState::None => write!(f, "none"),
            SubscriptionState::Pending => write!(f, "pending"),
            SubscriptionState::Unconfigured => write!(f, "unconfigured"),
            SubscriptionState::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// What a collection-node subscription is notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Items published to descendant leaf nodes
    Items,
    /// Nodes added to or removed from the collection
    #[default]
    Nodes,
}

impl SubscriptionType {
    /// Parse a subscription type from a form value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "items" => Some(SubscriptionType::Items),
            "nodes" => Some(SubscriptionType::Nodes),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionType::Items => write!(f, "items"),
            SubscriptionType::Nodes => write!(f, "nodes"),
        }
    }
}

/// Node variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Holds published items
    Leaf,
    /// Holds child nodes
    Collection,
}

impl NodeType {
    /// Parse a node type from a form value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "leaf" => Some(NodeType::Leaf),
            "collection" => Some(NodeType::Collection),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Leaf => write!(f, "leaf"),
            NodeType::Collection => write!(f, "collection"),
        }
    }
}

/// Who may associate new leaf nodes with a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationPolicy {
    /// Anyone
    #[default]
    All,
    /// Collection owners and service admins
    Owners,
    /// Owners plus the trusted whitelist
    Whitelist,
}

impl AssociationPolicy {
    /// Parse an association policy from a form value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "all" => Some(AssociationPolicy::All),
            "owners" => Some(AssociationPolicy::Owners),
            "whitelist" => Some(AssociationPolicy::Whitelist),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssociationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationPolicy::All => write!(f, "all"),
            AssociationPolicy::Owners => write!(f, "owners"),
            AssociationPolicy::Whitelist => write!(f, "whitelist"),
        }
    }
}

/// Who receives replies to published items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemReplyPolicy {
    /// Replies go to the node owners
    Owner,
    /// Replies go to the item publisher
    Publisher,
}

impl ItemReplyPolicy {
    /// Parse a reply policy from a form value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(ItemReplyPolicy::Owner),
            "publisher" => Some(ItemReplyPolicy::Publisher),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemReplyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemReplyPolicy::Owner => write!(f, "owner"),
            ItemReplyPolicy::Publisher => write!(f, "publisher"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affiliation_parse() {
        assert_eq!(Affiliation::from_str("owner"), Some(Affiliation::Owner));
        assert_eq!(Affiliation::from_str("member"), Some(Affiliation::None));
        assert_eq!(Affiliation::from_str("admin"), None);
        assert!(Affiliation::Publisher.can_publish());
        assert!(!Affiliation::None.can_publish());
    }

    #[test]
    fn test_subscription_state_display() {
        assert_eq!(SubscriptionState::Unconfigured.to_string(), "unconfigured");
        assert_eq!(
            SubscriptionState::from_str("pending"),
            Some(SubscriptionState::Pending)
        );
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&AssociationPolicy::Whitelist).unwrap();
        assert_eq!(json, "\"whitelist\"");
        let parsed: NodeType = serde_json::from_str("\"collection\"").unwrap();
        assert_eq!(parsed, NodeType::Collection);
    }
}

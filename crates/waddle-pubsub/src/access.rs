//! Access and publisher models.
//!
//! Pure decision functions: they read node and service state but never
//! mutate it. The engine consults them before any state change.

use std::fmt;

use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};

use crate::error::PubSubError;
use crate::node::NodeCore;
use crate::service::PubSubService;
use crate::types::Affiliation;

/// Access model for a PubSub node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    #[default]
    Open,
    /// Entities subscribed to an owner's presence.
    Presence,
    /// Entities in one of the allowed roster groups of an owner.
    Roster,
    /// Only explicitly affiliated JIDs can access.
    Whitelist,
    /// Anyone may request a subscription; an owner must approve it.
    Authorize,
}

impl AccessModel {
    /// Parse an access model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "whitelist" => Some(AccessModel::Whitelist),
            "authorize" => Some(AccessModel::Authorize),
            _ => None,
        }
    }

    /// Whether new subscriptions wait for owner approval.
    pub fn is_authorization_required(&self) -> bool {
        matches!(self, AccessModel::Authorize)
    }

    /// Whether `owner` (subscribing on behalf of `subscriber`) may subscribe.
    pub fn can_subscribe(&self, ctx: &AccessContext<'_>, owner: &BareJid, _subscriber: &Jid) -> bool {
        match self {
            AccessModel::Open | AccessModel::Authorize => true,
            AccessModel::Presence => ctx.is_admin(owner) || ctx.sees_owner_presence(owner),
            AccessModel::Roster => ctx.is_admin(owner) || ctx.in_allowed_group(owner),
            AccessModel::Whitelist => ctx.is_admin(owner) || ctx.is_whitelisted(owner),
        }
    }

    /// Whether `owner` may retrieve published items.
    pub fn can_access_items(&self, ctx: &AccessContext<'_>, owner: &BareJid, subscriber: &Jid) -> bool {
        match self {
            AccessModel::Authorize => ctx.is_admin(owner) || ctx.has_active_subscription(owner),
            _ => self.can_subscribe(ctx, owner, subscriber),
        }
    }

    /// Error reported when this model denies access.
    pub fn denial(&self) -> PubSubError {
        match self {
            AccessModel::Open => PubSubError::forbidden("access denied"),
            AccessModel::Presence => PubSubError::NotAuthorized {
                detail: "presence subscription required".to_string(),
                pubsub_condition: Some("presence-subscription-required"),
            },
            AccessModel::Roster => PubSubError::NotAuthorized {
                detail: "not in an allowed roster group".to_string(),
                pubsub_condition: Some("not-in-roster-group"),
            },
            AccessModel::Whitelist => PubSubError::NotAllowed {
                detail: "node is restricted to whitelisted entities".to_string(),
                pubsub_condition: Some("closed-node"),
            },
            AccessModel::Authorize => PubSubError::NotAuthorized {
                detail: "subscription not approved".to_string(),
                pubsub_condition: Some("not-subscribed"),
            },
        }
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Whitelist => "whitelist",
            AccessModel::Authorize => "authorize",
        };
        write!(f, "{}", s)
    }
}

/// Publisher model for a PubSub node.
///
/// Determines who can publish to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherModel {
    /// Anyone can publish.
    Open,
    /// Only owners and publishers can publish.
    #[default]
    Publishers,
    /// Owners, publishers and subscribers can publish.
    Subscribers,
}

impl PublisherModel {
    /// Parse a publisher model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PublisherModel::Open),
            "publishers" => Some(PublisherModel::Publishers),
            "subscribers" => Some(PublisherModel::Subscribers),
            _ => None,
        }
    }

    /// Whether `publisher` may publish to the node.
    pub fn can_publish(&self, node: &NodeCore, publisher: &Jid) -> bool {
        let bare = publisher.to_bare();
        let affiliation = node.affiliate(&bare).map(|a| a.affiliation());
        match self {
            PublisherModel::Open => true,
            PublisherModel::Publishers => affiliation.is_some_and(|a| a.can_publish()),
            PublisherModel::Subscribers => {
                affiliation.is_some_and(|a| a.can_publish())
                    || node.subscriptions_of(&bare).iter().any(|s| s.is_active())
            }
        }
    }
}

impl fmt::Display for PublisherModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublisherModel::Open => "open",
            PublisherModel::Publishers => "publishers",
            PublisherModel::Subscribers => "subscribers",
        };
        write!(f, "{}", s)
    }
}

/// Node and service state an access decision may consult.
pub struct AccessContext<'a> {
    pub node: &'a NodeCore,
    pub service: &'a PubSubService,
}

impl AccessContext<'_> {
    fn is_admin(&self, owner: &BareJid) -> bool {
        self.node.is_admin(self.service, &Jid::from(owner.clone()))
    }

    fn sees_owner_presence(&self, owner: &BareJid) -> bool {
        let roster = self.service.roster();
        self.node.owners().iter().any(|node_owner| {
            node_owner == owner
                || roster
                    .roster_item(node_owner, owner)
                    .is_some_and(|item| item.subscription.contact_sees_presence())
        })
    }

    fn in_allowed_group(&self, owner: &BareJid) -> bool {
        let allowed = &self.node.config().roster_groups_allowed;
        let roster = self.service.roster();
        self.node.owners().iter().any(|node_owner| {
            node_owner == owner
                || roster.roster_item(node_owner, owner).is_some_and(|item| {
                    item.groups.iter().any(|group| allowed.contains(group))
                })
        })
    }

    fn is_whitelisted(&self, owner: &BareJid) -> bool {
        self.node
            .affiliate(owner)
            .is_some_and(|a| a.affiliation() != Affiliation::Outcast)
    }

    fn has_active_subscription(&self, owner: &BareJid) -> bool {
        self.node
            .subscriptions_of(owner)
            .iter()
            .any(|s| s.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_model_parse() {
        assert_eq!(AccessModel::from_str("open"), Some(AccessModel::Open));
        assert_eq!(AccessModel::from_str("presence"), Some(AccessModel::Presence));
        assert_eq!(AccessModel::from_str("roster"), Some(AccessModel::Roster));
        assert_eq!(AccessModel::from_str("whitelist"), Some(AccessModel::Whitelist));
        assert_eq!(AccessModel::from_str("authorize"), Some(AccessModel::Authorize));
        assert_eq!(AccessModel::from_str("invalid"), None);
    }

    #[test]
    fn test_publisher_model_parse() {
        assert_eq!(PublisherModel::from_str("open"), Some(PublisherModel::Open));
        assert_eq!(
            PublisherModel::from_str("subscribers"),
            Some(PublisherModel::Subscribers)
        );
        assert_eq!(PublisherModel::from_str("owners"), None);
        assert_eq!(PublisherModel::Publishers.to_string(), "publishers");
    }

    #[test]
    fn test_authorization_required() {
        assert!(AccessModel::Authorize.is_authorization_required());
        assert!(!AccessModel::Whitelist.is_authorization_required());
    }

    #[test]
    fn test_denial_conditions() {
        assert_eq!(
            AccessModel::Whitelist.denial().pubsub_condition(),
            Some("closed-node")
        );
        assert_eq!(
            AccessModel::Presence.denial().pubsub_condition(),
            Some("presence-subscription-required")
        );
        assert!(matches!(
            AccessModel::Roster.denial(),
            PubSubError::NotAuthorized { .. }
        ));
    }
}

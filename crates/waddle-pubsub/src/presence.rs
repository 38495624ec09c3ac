//! Presence bookkeeping.
//!
//! [`PresenceCache`] remembers the last show value of every available
//! resource the service has heard from and doubles as the default
//! [`PresencePort`]. [`PresenceTracker`] reference-counts presence
//! subscriptions across all nodes of a service: the service stays subscribed
//! to a user's presence while at least one node needs it.

use std::collections::{HashMap, HashSet};

use dashmap::{DashMap, DashSet};
use jid::{BareJid, Jid};
use tracing::debug;

use crate::ports::PresencePort;

/// Show value recorded for an available presence without `<show/>`.
pub const SHOW_ONLINE: &str = "online";

/// Cache of available presences keyed by bare JID, then full JID.
#[derive(Debug, Default)]
pub struct PresenceCache {
    presences: DashMap<BareJid, HashMap<String, String>>,
    subscribed: DashSet<BareJid>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence update. `None` marks the resource unavailable.
    ///
    /// Returns `true` when the resource just became available.
    pub fn update_presence(&self, jid: &Jid, show: Option<&str>) -> bool {
        let bare = jid.to_bare();
        let full = jid.to_string();
        match show {
            Some(show) => {
                let show = if show.is_empty() { SHOW_ONLINE } else { show };
                let mut entry = self.presences.entry(bare).or_default();
                entry.insert(full, show.to_string()).is_none()
            }
            None => {
                let now_empty = match self.presences.get_mut(&bare) {
                    Some(mut resources) => {
                        resources.remove(&full);
                        resources.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.presences.remove(&bare);
                }
                false
            }
        }
    }

    /// Whether the service currently asked for the user's presence.
    pub fn is_subscribed(&self, user: &BareJid) -> bool {
        self.subscribed.contains(user)
    }
}

impl PresencePort for PresenceCache {
    fn show_presences(&self, jid: &Jid) -> Vec<String> {
        let Some(resources) = self.presences.get(&jid.to_bare()) else {
            return Vec::new();
        };
        if jid.resource().is_none() {
            resources.values().cloned().collect()
        } else {
            resources.get(&jid.to_string()).cloned().into_iter().collect()
        }
    }

    fn subscribe(&self, user: &BareJid) {
        debug!(user = %user, "Subscribing to presence");
        self.subscribed.insert(user.clone());
    }

    fn unsubscribe(&self, user: &BareJid) {
        debug!(user = %user, "Unsubscribing from presence");
        self.subscribed.remove(user);
        self.presences.remove(user);
    }
}

/// Per-user set of nodes that need the user's presence.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    required_by: DashMap<BareJid, HashSet<String>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether `node_id` needs the presence of `user`, subscribing on
    /// the first requirement and unsubscribing after the last one is released.
    pub fn set_required(
        &self,
        presence: &dyn PresencePort,
        node_id: &str,
        user: &BareJid,
        required: bool,
    ) {
        if required {
            let first = {
                let mut nodes = self.required_by.entry(user.clone()).or_default();
                let was_empty = nodes.is_empty();
                nodes.insert(node_id.to_string());
                was_empty
            };
            if first && presence.show_presences(&Jid::from(user.clone())).is_empty() {
                presence.subscribe(user);
            }
        } else {
            let released = match self.required_by.get_mut(user) {
                Some(mut nodes) => nodes.remove(node_id) && nodes.is_empty(),
                None => false,
            };
            if released {
                self.required_by.remove_if(user, |_, nodes| nodes.is_empty());
                presence.unsubscribe(user);
            }
        }
    }

    /// Release every requirement held by a node (node deletion).
    pub fn release_node(&self, presence: &dyn PresencePort, node_id: &str) {
        let users: Vec<BareJid> = self
            .required_by
            .iter()
            .filter(|entry| entry.value().contains(node_id))
            .map(|entry| entry.key().clone())
            .collect();
        for user in users {
            self.set_required(presence, node_id, &user, false);
        }
    }

    /// Whether any node requires the user's presence.
    pub fn is_required(&self, user: &BareJid) -> bool {
        self.required_by
            .get(user)
            .map(|nodes| !nodes.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_show_presences_bare_and_full() {
        let cache = PresenceCache::new();
        assert!(cache.update_presence(&jid("alice@example.com/phone"), Some("away")));
        assert!(cache.update_presence(&jid("alice@example.com/desk"), Some("")));
        assert!(!cache.update_presence(&jid("alice@example.com/desk"), Some("dnd")));

        let mut all = cache.show_presences(&jid("alice@example.com"));
        all.sort();
        assert_eq!(all, vec!["away".to_string(), "dnd".to_string()]);
        assert_eq!(
            cache.show_presences(&jid("alice@example.com/phone")),
            vec!["away".to_string()]
        );
        assert!(cache.show_presences(&jid("alice@example.com/tablet")).is_empty());
    }

    #[test]
    fn test_unavailable_removes_resource() {
        let cache = PresenceCache::new();
        cache.update_presence(&jid("bob@example.com/a"), None);
        cache.update_presence(&jid("bob@example.com/a"), Some("chat"));
        cache.update_presence(&jid("bob@example.com/a"), None);
        assert!(cache.show_presences(&jid("bob@example.com")).is_empty());
    }

    #[test]
    fn test_tracker_reference_counting() {
        let cache = PresenceCache::new();
        let tracker = PresenceTracker::new();
        let user = bare("carol@example.com");

        tracker.set_required(&cache, "a", &user, true);
        tracker.set_required(&cache, "b", &user, true);
        assert!(cache.is_subscribed(&user));

        tracker.set_required(&cache, "a", &user, false);
        assert!(cache.is_subscribed(&user), "node b still needs presence");
        assert!(tracker.is_required(&user));

        tracker.set_required(&cache, "b", &user, false);
        assert!(!cache.is_subscribed(&user));
        assert!(!tracker.is_required(&user));
    }

    #[test]
    fn test_tracker_skips_subscribe_when_presence_known() {
        let cache = PresenceCache::new();
        let tracker = PresenceTracker::new();
        cache.update_presence(&jid("dave@example.com/home"), Some("online"));

        tracker.set_required(&cache, "a", &bare("dave@example.com"), true);
        assert!(!cache.is_subscribed(&bare("dave@example.com")));
    }

    #[test]
    fn test_release_node() {
        let cache = PresenceCache::new();
        let tracker = PresenceTracker::new();
        let user = bare("erin@example.com");
        tracker.set_required(&cache, "gone", &user, true);
        tracker.release_node(&cache, "gone");
        assert!(!tracker.is_required(&user));
        assert!(!cache.is_subscribed(&user));
    }
}

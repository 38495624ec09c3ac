//! Recipient grouping for event notifications.
//!
//! A publication can reach one entity through several subscriptions: its own
//! subscription to the leaf, and subscriptions to ancestor collections. The
//! fan-out merges them so every delivery JID receives one notification
//! carrying the union of matching items and the ids of every satisfied
//! subscription.

use std::collections::BTreeSet;
use std::sync::Arc;

use jid::Jid;

use crate::item::PublishedItem;
use crate::node::NodeCore;
use crate::ports::{ItemView, ItemsEvent, Notification};
use crate::service::PubSubService;

#[derive(Debug)]
struct Recipient {
    jid: Jid,
    subscription_ids: Vec<String>,
    items: BTreeSet<usize>,
    include_body: bool,
}

/// Notification recipients collected across a node and its ancestors.
#[derive(Debug, Default)]
pub(crate) struct Fanout {
    recipients: Vec<Recipient>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    fn recipient(&mut self, jid: &Jid) -> &mut Recipient {
        let pos = match self.recipients.iter().position(|r| &r.jid == jid) {
            Some(pos) => pos,
            None => {
                self.recipients.push(Recipient {
                    jid: jid.clone(),
                    subscription_ids: Vec::new(),
                    items: BTreeSet::new(),
                    include_body: false,
                });
                self.recipients.len() - 1
            }
        };
        &mut self.recipients[pos]
    }

    /// Add the subscriptions of `core` that may receive events about
    /// `items`. `distance` is how far `core` sits above the publishing leaf;
    /// `None` for the leaf itself.
    pub fn add_publication(
        &mut self,
        core: &NodeCore,
        service: &PubSubService,
        distance: Option<usize>,
        items: &[Arc<PublishedItem>],
    ) {
        let ctx = core.delivery_context(service, distance);
        for subscription in core.subscriptions() {
            let matched: Vec<usize> = if items.is_empty() {
                if !subscription.can_send_publication_event(&ctx, None) {
                    continue;
                }
                Vec::new()
            } else {
                let mut matched = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if subscription.can_send_publication_event(&ctx, Some(&**item)) {
                        matched.push(i);
                    }
                }
                if matched.is_empty() {
                    continue;
                }
                matched
            };
            let recipient = self.recipient(subscription.jid());
            recipient.subscription_ids.push(subscription.id().to_string());
            recipient.items.extend(matched);
            recipient.include_body |= subscription.options().include_body;
        }
    }

    /// Add the subscriptions of collection `core` that may receive
    /// node-added and node-removed events.
    pub fn add_child_event(&mut self, core: &NodeCore, service: &PubSubService, distance: usize) {
        let ctx = core.delivery_context(service, Some(distance));
        for subscription in core.subscriptions() {
            if subscription.can_send_child_node_event(&ctx) {
                let recipient = self.recipient(subscription.jid());
                recipient.subscription_ids.push(subscription.id().to_string());
            }
        }
    }

    /// One items event per recipient. `views` are indexed like the items
    /// given to [`add_publication`](Self::add_publication).
    pub fn into_items_events(self, node_id: &str, views: &[ItemView]) -> Vec<(Jid, Notification)> {
        self.recipients
            .into_iter()
            .map(|r| {
                let items = r.items.iter().filter_map(|&i| views.get(i).cloned()).collect();
                let event = ItemsEvent {
                    node_id: node_id.to_string(),
                    items,
                    subscription_ids: r.subscription_ids,
                    include_body: r.include_body,
                    delayed: None,
                };
                (r.jid, Notification::Items(event))
            })
            .collect()
    }

    /// One retract event per recipient, listing the matching item ids.
    pub fn into_retract_events(self, node_id: &str, item_ids: &[String]) -> Vec<(Jid, Notification)> {
        self.recipients
            .into_iter()
            .map(|r| {
                let item_ids = r.items.iter().filter_map(|&i| item_ids.get(i).cloned()).collect();
                let notification = Notification::Retract {
                    node_id: node_id.to_string(),
                    item_ids,
                    subscription_ids: r.subscription_ids,
                };
                (r.jid, notification)
            })
            .collect()
    }

    /// Distinct delivery JIDs.
    pub fn into_targets(self) -> Vec<Jid> {
        self.recipients.into_iter().map(|r| r.jid).collect()
    }
}

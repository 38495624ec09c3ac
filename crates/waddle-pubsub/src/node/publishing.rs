//! Item publication, retraction and purging on leaf nodes.

use std::sync::Arc;

use chrono::Utc;
use jid::Jid;
use tracing::debug;

use crate::item::{generate_id, NewItem, Payload, PublishedItem, ITEM_ID_LENGTH};
use crate::node::{NodeState, NodeSubscription};
use crate::ports::{ItemView, ItemsEvent, Notification};
use crate::service::PubSubService;

impl NodeState {
    /// Store published items: same-id items are replaced, then the oldest
    /// items beyond the retention limit are evicted. Returns the stored
    /// items, or nothing when the node does not keep items.
    pub(crate) async fn publish_items(
        &mut self,
        service: &PubSubService,
        publisher: &Jid,
        items: Vec<NewItem>,
    ) -> Vec<Arc<PublishedItem>> {
        let deliver_payloads = self.core.config.deliver_payloads;
        let node_id = self.core.id.clone();
        let handle = self.core.handle.clone();
        let Some(leaf) = self.kind.as_leaf_mut() else {
            return Vec::new();
        };
        if !leaf.is_item_required(deliver_payloads) {
            return Vec::new();
        }
        let max = leaf.config.effective_max_items();
        let persist = leaf.config.persist_items;
        let queue = service.item_queue();

        let mut published: Vec<Arc<PublishedItem>> = Vec::with_capacity(items.len());
        for new_item in items {
            let id = match new_item.id.filter(|id| !id.is_empty()) {
                Some(id) => id,
                None => loop {
                    let id = generate_id(ITEM_ID_LENGTH);
                    if !leaf.items.contains(&id) {
                        break id;
                    }
                },
            };
            let payload = new_item.payload.into_iter().next().map(Payload::from_element);
            let item = Arc::new(PublishedItem::new(
                handle.clone(),
                node_id.clone(),
                id,
                publisher.clone(),
                Utc::now(),
                payload,
            ));
            for removed in leaf.items.insert(item.clone(), max) {
                queue.delete(removed.key()).await;
            }
            if persist {
                queue.add(item.clone()).await;
            }
            published.retain(|p| p.id() != item.id());
            published.push(item);
        }
        debug!(node = %node_id, count = published.len(), retained = leaf.items.len(), "Items published");
        published
    }

    /// Remove items by id. Unknown ids are skipped.
    pub(crate) async fn delete_items(
        &mut self,
        service: &PubSubService,
        ids: &[String],
    ) -> Vec<Arc<PublishedItem>> {
        let Some(leaf) = self.kind.as_leaf_mut() else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for id in ids {
            if let Some(item) = leaf.items.remove(id) {
                service.item_queue().delete(item.key()).await;
                removed.push(item);
            }
        }
        removed
    }

    /// Keep only the most recent item and tell subscribers.
    pub(crate) async fn purge(&mut self, service: &PubSubService) -> usize {
        let Some(leaf) = self.kind.as_leaf_mut() else {
            return 0;
        };
        let removed = leaf.items.purge_keep_last();
        for item in &removed {
            service.item_queue().delete(item.key()).await;
        }
        let targets = self.core.node_event_targets(service, false);
        service.broadcast(
            &self.core.id,
            Notification::Purge {
                node_id: self.core.id.clone(),
            },
            &targets,
        );
        removed.len()
    }

    /// Event view of an item. The payload is included when the node
    /// delivers payloads or `force_payload` is set.
    pub(crate) fn item_view(&self, item: &PublishedItem, force_payload: bool) -> ItemView {
        let with_payload = force_payload || self.core.config.deliver_payloads;
        ItemView {
            id: item.id().to_string(),
            publisher: item.publisher().clone(),
            published_at: item.created_at(),
            payload: if with_payload {
                item.payload_element().cloned()
            } else {
                None
            },
        }
    }

    /// Replay the last published item to one subscription, if it may
    /// receive it.
    pub(crate) fn send_last_published_item(
        &self,
        service: &PubSubService,
        subscription: &NodeSubscription,
    ) -> bool {
        let Some(item) = self.kind.last_published_item() else {
            return false;
        };
        let ctx = self.core.delivery_context(service, None);
        if !subscription.can_send_publication_event(&ctx, Some(&*item)) {
            return false;
        }
        let event = ItemsEvent {
            node_id: self.core.id.clone(),
            items: vec![self.item_view(&item, false)],
            subscription_ids: vec![subscription.id().to_string()],
            include_body: subscription.options().include_body,
            delayed: Some(item.created_at()),
        };
        service.send(subscription.jid(), Notification::Items(event));
        true
    }
}

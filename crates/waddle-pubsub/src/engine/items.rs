//! Publishing, retracting and retrieving items.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::access::AccessContext;
use crate::engine::{GetItems, PubSubEngine, Publish, Retract};
use crate::error::PubSubError;
use crate::item::PublishedItem;
use crate::metrics;
use crate::node::Fanout;
use crate::ports::ItemView;
use crate::types::Affiliation;

impl PubSubEngine {
    /// Publish items to a leaf and notify its subscribers and those of the
    /// collections above it. Returns the ids of the stored items.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from, items = req.items.len()))]
    pub async fn publish(&self, req: Publish) -> Result<Vec<String>, PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        let mut fanout = Fanout::new();

        let (published, views, parent) = {
            let mut state = node.write().await;
            state.ensure_live()?;
            {
                let core = state.core();
                if !core.config().publisher_model.can_publish(core, &req.from)
                    && !service.is_service_admin(&req.from)
                {
                    return Err(PubSubError::forbidden("publisher model denies publishing"));
                }
                let leaf = state
                    .kind()
                    .as_leaf()
                    .ok_or(PubSubError::unsupported("publish"))?;
                let deliver_payloads = core.config().deliver_payloads;
                let item_required = leaf.is_item_required(deliver_payloads);
                if item_required && req.items.is_empty() {
                    return Err(PubSubError::ItemRequired);
                }
                if !item_required && !req.items.is_empty() {
                    return Err(PubSubError::ItemForbidden);
                }
                for item in &req.items {
                    match item.payload.as_slice() {
                        [] if deliver_payloads => return Err(PubSubError::PayloadRequired),
                        [] => {}
                        [payload] => {
                            let size = String::from(payload).len();
                            if !leaf.config().accepts_payload(size) {
                                return Err(PubSubError::PayloadTooBig {
                                    size,
                                    limit: leaf.config().max_payload_size.max(0) as usize,
                                });
                            }
                        }
                        _ => return Err(PubSubError::InvalidPayload),
                    }
                }
            }

            let published = state.publish_items(service, &req.from, req.items).await;
            let views: Vec<ItemView> = published
                .iter()
                .map(|item| state.item_view(item, false))
                .collect();
            fanout.add_publication(state.core(), service, None, &published);
            (published, views, state.core().parent().map(str::to_string))
        };

        self.add_ancestor_recipients(&mut fanout, parent.as_deref(), &published)
            .await;
        for (to, notification) in fanout.into_items_events(node.id(), &views) {
            service.send(&to, notification);
        }
        metrics::record_items_published(published.len(), service.service_id());
        let item_ids: Vec<String> = published.iter().map(|i| i.id().to_string()).collect();
        debug!(node = %node.id(), items = ?item_ids, "Publication delivered");
        Ok(item_ids)
    }

    /// Delete items. Each must exist and be deletable by the requester.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn retract(&self, req: Retract) -> Result<(), PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        if req.item_ids.is_empty() {
            return Err(PubSubError::ItemRequired);
        }
        let mut fanout = Fanout::new();

        let (removed, parent, notify) = {
            let mut state = node.write().await;
            state.ensure_live()?;
            {
                let deliver_payloads = state.core().config().deliver_payloads;
                let leaf = state
                    .kind()
                    .as_leaf()
                    .filter(|leaf| leaf.is_item_required(deliver_payloads))
                    .ok_or(PubSubError::unsupported("persistent-items"))?;
                let node_admin = state.core().is_admin(service, &req.from);
                for id in &req.item_ids {
                    let item = leaf
                        .items()
                        .get(id)
                        .ok_or_else(|| PubSubError::ItemNotFound(id.clone()))?;
                    if !item.can_delete(&req.from, node_admin) {
                        return Err(PubSubError::forbidden(
                            "only the publisher or a node owner may retract an item",
                        ));
                    }
                }
            }
            let removed = state.delete_items(service, &req.item_ids).await;
            let notify = state.core().config().notify_retract;
            if notify {
                fanout.add_publication(state.core(), service, None, &removed);
            }
            (removed, state.core().parent().map(str::to_string), notify)
        };

        if notify {
            self.add_ancestor_recipients(&mut fanout, parent.as_deref(), &removed)
                .await;
            let ids: Vec<String> = removed.iter().map(|i| i.id().to_string()).collect();
            for (to, notification) in fanout.into_retract_events(node.id(), &ids) {
                service.send(&to, notification);
            }
        }
        metrics::record_items_retracted(removed.len(), service.service_id());
        debug!(node = %node.id(), retracted = removed.len(), "Items retracted");
        Ok(())
    }

    /// Items of a leaf: the `max_items` most recent, the requested ids, or
    /// everything retained. Items are filtered by the subscription keyword.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn get_items(&self, req: GetItems) -> Result<Vec<ItemView>, PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        let state = node.read().await;
        state.ensure_live()?;
        let core = state.core();
        let leaf = state
            .kind()
            .as_leaf()
            .ok_or(PubSubError::unsupported("retrieve-items"))?;

        let owner = req.from.to_bare();
        let access_model = core.config().access_model;
        let ctx = AccessContext {
            node: core,
            service,
        };
        if !access_model.can_access_items(&ctx, &owner, &req.from) {
            return Err(access_model.denial());
        }
        if core
            .affiliate(&owner)
            .is_some_and(|a| a.affiliation() == Affiliation::Outcast)
        {
            return Err(PubSubError::forbidden("requester is banned from the node"));
        }

        let subscription = if service.multiple_subscriptions_enabled()
            && !core.subscriptions_of(&owner).is_empty()
        {
            let id = req
                .subscription_id
                .as_deref()
                .ok_or(PubSubError::SubIdRequired)?;
            Some(
                core.subscription(id)
                    .ok_or_else(|| PubSubError::InvalidSubscriptionId(id.to_string()))?,
            )
        } else {
            None
        };
        if subscription.is_some_and(|s| !s.is_active()) {
            return Err(PubSubError::NotSubscribed);
        }

        let (items, force_payload): (Vec<Arc<PublishedItem>>, bool) = match req.max_items {
            Some(max) => (leaf.items().recent(Some(max)), false),
            None if req.item_ids.is_empty() => (leaf.items().recent(None), false),
            None => (
                req.item_ids
                    .iter()
                    .filter_map(|id| leaf.items().get(id).cloned())
                    .collect(),
                true,
            ),
        };
        Ok(items
            .iter()
            .filter(|item| subscription.map_or(true, |s| s.is_keyword_matched(item)))
            .map(|item| state.item_view(item, force_payload))
            .collect())
    }

    /// Add subscribers of the collections above a node, `parent` being the
    /// node's parent id.
    async fn add_ancestor_recipients(
        &self,
        fanout: &mut Fanout,
        parent: Option<&str>,
        items: &[Arc<PublishedItem>],
    ) {
        for (distance, ancestor) in self.service.ancestors(parent).await {
            let state = ancestor.read().await;
            if state.ensure_live().is_ok() {
                fanout.add_publication(state.core(), &self.service, Some(distance), items);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{collection_form, create, drain, engine, jid};
    use crate::engine::Subscribe;
    use crate::form::DataForm;
    use crate::item::{NewItem, ITEM_ID_LENGTH};
    use crate::node::config::fields;
    use crate::node::subscription::fields as sub_fields;
    use crate::ports::Notification;
    use minidom::Element;

    fn entry(text: &str) -> Element {
        format!("<entry xmlns='urn:test'>{text}</entry>").parse().unwrap()
    }

    fn publish(node: &str, from: &str, items: Vec<NewItem>) -> Publish {
        Publish {
            from: jid(from),
            node_id: Some(node.to_string()),
            items,
        }
    }

    async fn persistent_leaf(engine: &PubSubEngine, id: &str, max_items: &str) {
        let form = DataForm::submit()
            .with_field(fields::PERSIST_ITEMS, ["1"])
            .with_field(fields::MAX_ITEMS, [max_items]);
        create(engine, id, "alice@example.com", Some(form)).await;
    }

    #[tokio::test]
    async fn test_publish_generates_id() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let ids = engine
            .publish(publish("news", "alice@example.com", vec![NewItem::new(None, Some(entry("hi")))]))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].len(), ITEM_ID_LENGTH);
        let node = engine.service().node("news").unwrap();
        let last = node.read().await.kind().last_published_item().unwrap();
        assert_eq!(last.id(), ids[0]);
    }

    #[tokio::test]
    async fn test_publish_requires_publisher() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let result = engine
            .publish(publish("news", "bob@example.com", vec![NewItem::new(None, Some(entry("x")))]))
            .await;
        assert!(matches!(result, Err(PubSubError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_publish_guards() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        create(&engine, "c", "alice@example.com", Some(collection_form(None))).await;

        assert_eq!(
            engine.publish(publish("news", "alice@example.com", vec![])).await,
            Err(PubSubError::ItemRequired)
        );
        assert_eq!(
            engine
                .publish(publish("news", "alice@example.com", vec![NewItem::new(Some("a".into()), None)]))
                .await,
            Err(PubSubError::PayloadRequired)
        );
        let two = NewItem {
            id: None,
            payload: vec![entry("a"), entry("b")],
        };
        assert_eq!(
            engine.publish(publish("news", "alice@example.com", vec![two])).await,
            Err(PubSubError::InvalidPayload)
        );
        assert_eq!(
            engine
                .publish(publish("c", "alice@example.com", vec![NewItem::new(None, Some(entry("x")))]))
                .await,
            Err(PubSubError::unsupported("publish"))
        );
    }

    #[tokio::test]
    async fn test_notification_only_node_forbids_items() {
        let (engine, mut rx) = engine().await;
        let form = DataForm::submit().with_field(fields::DELIVER_PAYLOADS, ["0"]);
        create(&engine, "pings", "alice@example.com", Some(form)).await;
        engine
            .subscribe(Subscribe {
                from: jid("bob@example.com"),
                node_id: Some("pings".into()),
                jid: Some(jid("bob@example.com")),
                options: None,
            })
            .await
            .unwrap();
        drain(&mut rx);

        assert_eq!(
            engine
                .publish(publish("pings", "alice@example.com", vec![NewItem::new(None, Some(entry("x")))]))
                .await,
            Err(PubSubError::ItemForbidden)
        );
        let ids = engine
            .publish(publish("pings", "alice@example.com", vec![]))
            .await
            .unwrap();
        assert!(ids.is_empty());
        let deliveries: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|d| d.to == jid("bob@example.com"))
            .collect();
        assert!(matches!(
            &deliveries[..],
            [delivery] if matches!(&delivery.notification, Notification::Items(e) if e.items.is_empty())
        ));
    }

    #[tokio::test]
    async fn test_payload_too_big() {
        let (engine, _rx) = engine().await;
        let form = DataForm::submit().with_field(fields::MAX_PAYLOAD_SIZE, ["10"]);
        create(&engine, "news", "alice@example.com", Some(form)).await;
        let result = engine
            .publish(publish(
                "news",
                "alice@example.com",
                vec![NewItem::new(None, Some(entry("far too long for the limit")))],
            ))
            .await;
        assert!(matches!(result, Err(PubSubError::PayloadTooBig { limit: 10, .. })));
    }

    #[tokio::test]
    async fn test_publish_notifies_subscriber_once() {
        let (engine, mut rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        engine
            .subscribe(Subscribe {
                from: jid("bob@example.com"),
                node_id: Some("news".into()),
                jid: Some(jid("bob@example.com")),
                options: None,
            })
            .await
            .unwrap();
        drain(&mut rx);

        engine
            .publish(publish("news", "alice@example.com", vec![NewItem::new(Some("1".into()), Some(entry("hi")))]))
            .await
            .unwrap();
        let to_bob: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|d| d.to == jid("bob@example.com"))
            .collect();
        assert_eq!(to_bob.len(), 1);
        match &to_bob[0].notification {
            Notification::Items(event) => {
                assert_eq!(event.items.len(), 1);
                assert!(event.items[0].payload.is_some());
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retract() {
        let (engine, mut rx) = engine().await;
        persistent_leaf(&engine, "news", "10").await;
        engine
            .publish(publish("news", "alice@example.com", vec![NewItem::new(Some("1".into()), Some(entry("x")))]))
            .await
            .unwrap();
        drain(&mut rx);

        let retract = |ids: &[&str], from: &str| Retract {
            from: jid(from),
            node_id: Some("news".into()),
            item_ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        assert_eq!(engine.retract(retract(&[], "alice@example.com")).await, Err(PubSubError::ItemRequired));
        assert_eq!(
            engine.retract(retract(&["9"], "alice@example.com")).await,
            Err(PubSubError::ItemNotFound("9".into()))
        );
        assert!(matches!(
            engine.retract(retract(&["1"], "bob@example.com")).await,
            Err(PubSubError::Forbidden(_))
        ));
        engine.retract(retract(&["1"], "alice@example.com")).await.unwrap();

        let node = engine.service().node("news").unwrap();
        assert!(node.read().await.kind().published_item("1").is_none());
        assert!(drain(&mut rx).iter().any(|d| matches!(
            &d.notification,
            Notification::Retract { item_ids, .. } if item_ids == &vec!["1".to_string()]
        )));
    }

    #[tokio::test]
    async fn test_get_items_max_and_ids() {
        let (engine, _rx) = engine().await;
        persistent_leaf(&engine, "news", "10").await;
        for id in ["1", "2", "3"] {
            engine
                .publish(publish("news", "alice@example.com", vec![NewItem::new(Some(id.into()), Some(entry(id)))]))
                .await
                .unwrap();
        }
        let get = |max_items: Option<usize>, item_ids: Vec<String>| GetItems {
            from: jid("bob@example.com"),
            node_id: Some("news".into()),
            subscription_id: None,
            max_items,
            item_ids,
        };
        let recent = engine.get_items(get(Some(2), vec![])).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        let picked = engine.get_items(get(None, vec!["1".into(), "7".into()])).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert!(picked[0].payload.is_some());

        assert_eq!(engine.get_items(get(None, vec![])).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_get_items_subscription_checks() {
        let (engine, _rx) = engine().await;
        persistent_leaf(&engine, "news", "10").await;
        let subscription = engine
            .subscribe(Subscribe {
                from: jid("bob@example.com"),
                node_id: Some("news".into()),
                jid: Some(jid("bob@example.com")),
                options: Some(DataForm::submit().with_field(sub_fields::KEYWORDS, ["rust"])),
            })
            .await
            .unwrap();
        for (id, text) in [("1", "rust news"), ("2", "other news")] {
            engine
                .publish(publish("news", "alice@example.com", vec![NewItem::new(Some(id.into()), Some(entry(text)))]))
                .await
                .unwrap();
        }
        let get = |subscription_id: Option<String>| GetItems {
            from: jid("bob@example.com"),
            node_id: Some("news".into()),
            subscription_id,
            max_items: None,
            item_ids: vec![],
        };
        assert_eq!(engine.get_items(get(None)).await, Err(PubSubError::SubIdRequired));
        assert_eq!(
            engine.get_items(get(Some("bogus".into()))).await,
            Err(PubSubError::InvalidSubscriptionId("bogus".into()))
        );
        let items = engine
            .get_items(get(Some(subscription.subscription_id)))
            .await
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_get_items_from_collection() {
        let (engine, _rx) = engine().await;
        create(&engine, "c", "alice@example.com", Some(collection_form(None))).await;
        let result = engine
            .get_items(GetItems {
                from: jid("alice@example.com"),
                node_id: Some("c".into()),
                subscription_id: None,
                max_items: None,
                item_ids: vec![],
            })
            .await;
        assert_eq!(result, Err(PubSubError::unsupported("retrieve-items")));
    }

    #[tokio::test]
    async fn test_publish_reaches_collection_subscriber() {
        let (engine, mut rx) = engine().await;
        create(&engine, "c", "alice@example.com", Some(collection_form(None))).await;
        create(&engine, "leaf", "alice@example.com", Some(DataForm::submit().with_field(fields::COLLECTION, ["c"]))).await;
        engine
            .subscribe(Subscribe {
                from: jid("carol@example.com"),
                node_id: Some("c".into()),
                jid: Some(jid("carol@example.com")),
                options: Some(DataForm::submit().with_field(sub_fields::SUBSCRIPTION_TYPE, ["items"])),
            })
            .await
            .unwrap();
        drain(&mut rx);

        engine
            .publish(publish("leaf", "alice@example.com", vec![NewItem::new(None, Some(entry("x")))]))
            .await
            .unwrap();
        let to_carol = drain(&mut rx)
            .into_iter()
            .filter(|d| d.to == jid("carol@example.com"))
            .count();
        assert_eq!(to_carol, 1);
    }
}

//! Subscriber-side operations: subscribing, options, and the requester's
//! own subscriptions and affiliations.

use jid::Jid;
use tracing::{debug, info, instrument};

use crate::access::AccessContext;
use crate::engine::{
    AffiliationInfo, GetAffiliations, GetSubscriptionOptions, GetSubscriptions, PubSubEngine,
    SetSubscriptionOptions, Subscribe, SubscriptionInfo, Unsubscribe,
};
use crate::error::PubSubError;
use crate::form::DataForm;
use crate::node::subscription::fields;
use crate::node::{NodeCore, NodeSubscription};
use crate::types::{Affiliation, SubscriptionType};

impl PubSubEngine {
    /// Subscribe `jid` to a node, or to the root collection when no node is
    /// named.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn subscribe(&self, req: Subscribe) -> Result<SubscriptionInfo, PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.node_or_root(req.node_id.as_deref())?;
        let jid = req.jid.ok_or(PubSubError::JidRequired)?;
        let service_admin = service.is_service_admin(&req.from);
        if jid.to_bare() != req.from.to_bare() && !service_admin {
            return Err(PubSubError::InvalidJid(jid.to_string()));
        }
        let owner = jid.to_bare();

        let mut state = node.write().await;
        state.ensure_live()?;
        let core = state.core();
        let access_model = core.config().access_model;
        let ctx = AccessContext {
            node: core,
            service,
        };
        if !access_model.can_subscribe(&ctx, &owner, &jid) {
            return Err(access_model.denial());
        }
        let affiliate = core.affiliate(&owner);
        if affiliate.is_some_and(|a| a.affiliation() == Affiliation::Outcast) {
            return Err(PubSubError::forbidden("subscriber is banned from the node"));
        }
        if !core.config().subscription_enabled && !service_admin {
            return Err(PubSubError::not_allowed("subscriptions are disabled"));
        }

        if !node.is_collection() && !service.multiple_subscriptions_enabled() {
            if let Some(existing) = core.subscription_by_jid(&jid) {
                debug!(subscription = %existing.id(), "Returning existing subscription");
                return Ok(existing.into());
            }
        }
        if node.is_collection() {
            let requested = match req.options.as_ref().and_then(|f| f.value(fields::SUBSCRIPTION_TYPE)) {
                Some("items") => SubscriptionType::Items,
                _ => SubscriptionType::Nodes,
            };
            for existing in core.subscriptions_of(&owner) {
                let existing_type = existing.options().subscription_type;
                if requested == SubscriptionType::Nodes && existing_type == SubscriptionType::Nodes {
                    return Err(PubSubError::Conflict(format!(
                        "{owner} already has a nodes subscription to {}",
                        node.id()
                    )));
                }
                if requested == SubscriptionType::Items
                    && !service.multiple_subscriptions_enabled()
                    && existing_type == SubscriptionType::Items
                {
                    return Ok(existing.into());
                }
            }
        }

        let subscription = state
            .create_subscription(
                service,
                &owner,
                &jid,
                access_model.is_authorization_required(),
                req.options.as_ref(),
            )
            .await;
        info!(
            node = %node.id(),
            subscription = %subscription.id(),
            state = %subscription.state(),
            "Subscribed"
        );
        Ok(SubscriptionInfo::from(&subscription))
    }

    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn unsubscribe(&self, req: Unsubscribe) -> Result<(), PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let jid = req.jid.as_ref().ok_or(PubSubError::JidRequired)?;
        let node = self.node_or_root(req.node_id.as_deref())?;

        let mut state = node.write().await;
        state.ensure_live()?;
        let id = {
            let core = state.core();
            let subscription =
                self.select_subscription(core, Some(jid), req.subscription_id.as_deref())?;
            let service_admin = service.is_service_admin(&req.from);
            if !core.config().subscription_enabled && !service_admin {
                return Err(PubSubError::not_allowed("subscriptions are disabled"));
            }
            if !subscription.can_modify(&req.from, service_admin) {
                return Err(PubSubError::forbidden("requester may not cancel this subscription"));
            }
            subscription.id().to_string()
        };
        state.cancel_subscription(service, &id, true).await;
        info!(node = %node.id(), subscription = %id, "Unsubscribed");
        Ok(())
    }

    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn get_subscription_options(
        &self,
        req: GetSubscriptionOptions,
    ) -> Result<DataForm, PubSubError> {
        self.ensure_available()?;
        let node = self.node_or_root(req.node_id.as_deref())?;
        let state = node.read().await;
        state.ensure_live()?;
        let subscription = self.select_subscription(
            state.core(),
            req.jid.as_ref(),
            req.subscription_id.as_deref(),
        )?;
        if !subscription.can_modify(&req.from, self.service.is_service_admin(&req.from)) {
            return Err(PubSubError::forbidden("requester may not read these options"));
        }
        Ok(subscription.options_form(node.is_collection()))
    }

    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn set_subscription_options(
        &self,
        req: SetSubscriptionOptions,
    ) -> Result<SubscriptionInfo, PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.node_or_root(req.node_id.as_deref())?;
        let mut state = node.write().await;
        state.ensure_live()?;
        let id = {
            let subscription = self.select_subscription(
                state.core(),
                req.jid.as_ref(),
                req.subscription_id.as_deref(),
            )?;
            if !subscription.can_modify(&req.from, service.is_service_admin(&req.from)) {
                return Err(PubSubError::forbidden("requester may not change these options"));
            }
            subscription.id().to_string()
        };
        let form = req
            .form
            .as_ref()
            .ok_or_else(|| PubSubError::bad_request("options form missing"))?;
        let subscription = state
            .configure_subscription(service, &id, form)
            .await
            .ok_or_else(|| PubSubError::SubscriptionNotFound(id.clone()))?;
        Ok(SubscriptionInfo::from(&subscription))
    }

    /// Subscriptions held by the requester's bare JID.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn get_subscriptions(
        &self,
        req: GetSubscriptions,
    ) -> Result<Vec<SubscriptionInfo>, PubSubError> {
        self.ensure_available()?;
        let owner = req.from.to_bare();
        let nodes = match req.node_id.as_deref() {
            Some(id) => vec![self
                .service
                .node(id)
                .ok_or_else(|| PubSubError::NodeNotFound(id.to_string()))?],
            None => self.service.nodes(),
        };
        let mut subscriptions = Vec::new();
        for node in nodes {
            let state = node.read().await;
            if state.ensure_live().is_err() {
                continue;
            }
            subscriptions.extend(
                state
                    .core()
                    .subscriptions_of(&owner)
                    .into_iter()
                    .map(SubscriptionInfo::from),
            );
        }
        subscriptions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(subscriptions)
    }

    /// Affiliations held by the requester's bare JID. Having none is
    /// reported as `ItemNotFound`.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn get_affiliations(
        &self,
        req: GetAffiliations,
    ) -> Result<Vec<AffiliationInfo>, PubSubError> {
        self.ensure_available()?;
        let owner = req.from.to_bare();
        let mut affiliations = Vec::new();
        for node in self.service.nodes() {
            if req.node_id.as_deref().is_some_and(|id| id != node.id()) {
                continue;
            }
            let state = node.read().await;
            if state.ensure_live().is_err() {
                continue;
            }
            if let Some(affiliate) = state.core().affiliate(&owner) {
                affiliations.push(AffiliationInfo {
                    node_id: node.id().to_string(),
                    jid: affiliate.jid().clone(),
                    affiliation: affiliate.affiliation(),
                });
            }
        }
        if affiliations.is_empty() {
            return Err(PubSubError::ItemNotFound(format!("affiliations of {owner}")));
        }
        affiliations.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(affiliations)
    }

    /// The subscription a request refers to. With multiple subscriptions
    /// enabled it is picked by id, otherwise by delivery JID.
    fn select_subscription<'a>(
        &self,
        core: &'a NodeCore,
        jid: Option<&Jid>,
        subscription_id: Option<&str>,
    ) -> Result<&'a NodeSubscription, PubSubError> {
        if self.service.multiple_subscriptions_enabled() {
            let id = subscription_id.ok_or(PubSubError::SubIdRequired)?;
            core.subscription(id)
                .ok_or_else(|| PubSubError::InvalidSubscriptionId(id.to_string()))
        } else {
            let jid = jid.ok_or(PubSubError::JidRequired)?;
            core.subscription_by_jid(jid).ok_or(PubSubError::NotSubscribed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::access::AccessModel;
    use crate::config::ServiceConfig;
    use crate::engine::tests::{collection_form, create, drain, engine, jid};
    use crate::node::config::fields as node_fields;
    use crate::ports::{ChannelBroadcaster, Notification};
    use crate::service::{PubSubService, ServicePorts};
    use crate::types::SubscriptionState;

    fn subscribe(node: Option<&str>, from: &str, options: Option<DataForm>) -> Subscribe {
        Subscribe {
            from: jid(from),
            node_id: node.map(str::to_string),
            jid: Some(jid(from)),
            options,
        }
    }

    async fn single_subscription_engine() -> PubSubEngine {
        let (broadcaster, _rx) = ChannelBroadcaster::new();
        let config = ServiceConfig {
            multiple_subscriptions_enabled: false,
            ..ServiceConfig::default()
        };
        let service = PubSubService::new(config, ServicePorts::in_memory(Arc::new(broadcaster)))
            .await
            .unwrap();
        PubSubEngine::new(service)
    }

    #[tokio::test]
    async fn test_subscribe_open_node() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let info = engine
            .subscribe(subscribe(Some("news"), "bob@example.com/phone", None))
            .await
            .unwrap();
        assert_eq!(info.state, SubscriptionState::Subscribed);
        assert_eq!(info.jid, jid("bob@example.com/phone"));

        let node = engine.service().node("news").unwrap();
        let state = node.read().await;
        let affiliate = state.core().affiliate(&jid("bob@example.com").to_bare()).unwrap();
        assert_eq!(affiliate.affiliation(), Affiliation::None);
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;

        let mut missing = subscribe(Some("news"), "bob@example.com", None);
        missing.jid = None;
        assert_eq!(engine.subscribe(missing).await, Err(PubSubError::JidRequired));

        let mut other = subscribe(Some("news"), "bob@example.com", None);
        other.jid = Some(jid("eve@example.com"));
        assert!(matches!(engine.subscribe(other).await, Err(PubSubError::InvalidJid(_))));

        assert_eq!(
            engine.subscribe(subscribe(Some("nope"), "bob@example.com", None)).await,
            Err(PubSubError::NodeNotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_subscribe_disabled() {
        let (engine, _rx) = engine().await;
        let form = DataForm::submit().with_field(node_fields::SUBSCRIBE, ["0"]);
        create(&engine, "news", "alice@example.com", Some(form)).await;
        assert!(matches!(
            engine.subscribe(subscribe(Some("news"), "bob@example.com", None)).await,
            Err(PubSubError::NotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn test_authorize_model_sends_request_to_owner() {
        let (engine, mut rx) = engine().await;
        let form = DataForm::submit().with_field(node_fields::ACCESS_MODEL, ["authorize"]);
        create(&engine, "news", "alice@example.com", Some(form)).await;
        drain(&mut rx);

        let info = engine
            .subscribe(subscribe(Some("news"), "bob@example.com", None))
            .await
            .unwrap();
        assert_eq!(info.state, SubscriptionState::Pending);
        let requests: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|d| matches!(d.notification, Notification::AuthorizationRequest { .. }))
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].to, jid("alice@example.com"));

        let node = engine.service().node("news").unwrap();
        assert_eq!(node.read().await.core().config().access_model, AccessModel::Authorize);
    }

    #[tokio::test]
    async fn test_existing_subscription_returned_without_multiple() {
        let engine = single_subscription_engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let first = engine
            .subscribe(subscribe(Some("news"), "bob@example.com", None))
            .await
            .unwrap();
        let second = engine
            .subscribe(subscribe(Some("news"), "bob@example.com", None))
            .await
            .unwrap();
        assert_eq!(first.subscription_id, second.subscription_id);
    }

    #[tokio::test]
    async fn test_collection_nodes_subscription_conflict() {
        let (engine, _rx) = engine().await;
        create(&engine, "c", "alice@example.com", Some(collection_form(None))).await;
        engine
            .subscribe(subscribe(Some("c"), "bob@example.com", None))
            .await
            .unwrap();
        assert!(matches!(
            engine.subscribe(subscribe(Some("c"), "bob@example.com", None)).await,
            Err(PubSubError::Conflict(_))
        ));
        let items = DataForm::submit().with_field(fields::SUBSCRIPTION_TYPE, ["items"]);
        engine
            .subscribe(subscribe(Some("c"), "bob@example.com", Some(items)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_without_node_targets_root() {
        let (engine, _rx) = engine().await;
        let info = engine
            .subscribe(subscribe(None, "bob@example.com", None))
            .await
            .unwrap();
        assert_eq!(info.node_id, crate::node::ROOT_NODE_ID);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let info = engine
            .subscribe(subscribe(Some("news"), "bob@example.com", None))
            .await
            .unwrap();
        let unsubscribe = |from: &str, subscription_id: Option<String>| Unsubscribe {
            from: jid(from),
            node_id: Some("news".into()),
            jid: Some(jid("bob@example.com")),
            subscription_id,
        };

        assert_eq!(
            engine.unsubscribe(unsubscribe("bob@example.com", None)).await,
            Err(PubSubError::SubIdRequired)
        );
        assert!(matches!(
            engine
                .unsubscribe(unsubscribe("eve@example.com", Some(info.subscription_id.clone())))
                .await,
            Err(PubSubError::Forbidden(_))
        ));
        engine
            .unsubscribe(unsubscribe("bob@example.com", Some(info.subscription_id.clone())))
            .await
            .unwrap();

        let node = engine.service().node("news").unwrap();
        let state = node.read().await;
        assert!(state.core().subscription(&info.subscription_id).is_none());
        assert!(state.core().affiliate(&jid("bob@example.com").to_bare()).is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_by_jid_without_multiple() {
        let engine = single_subscription_engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let unsubscribe = Unsubscribe {
            from: jid("bob@example.com"),
            node_id: Some("news".into()),
            jid: Some(jid("bob@example.com")),
            subscription_id: None,
        };
        assert_eq!(
            engine.unsubscribe(unsubscribe.clone()).await,
            Err(PubSubError::NotSubscribed)
        );
        engine
            .subscribe(subscribe(Some("news"), "bob@example.com", None))
            .await
            .unwrap();
        engine.unsubscribe(unsubscribe).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_options_round_trip() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let info = engine
            .subscribe(subscribe(Some("news"), "bob@example.com", None))
            .await
            .unwrap();

        let missing_form = SetSubscriptionOptions {
            from: jid("bob@example.com"),
            node_id: Some("news".into()),
            jid: Some(jid("bob@example.com")),
            subscription_id: Some(info.subscription_id.clone()),
            form: None,
        };
        assert!(matches!(
            engine.set_subscription_options(missing_form.clone()).await,
            Err(PubSubError::BadRequest(_))
        ));

        let set = SetSubscriptionOptions {
            form: Some(DataForm::submit().with_field(fields::KEYWORDS, ["rust"])),
            ..missing_form
        };
        engine.set_subscription_options(set).await.unwrap();

        let form = engine
            .get_subscription_options(GetSubscriptionOptions {
                from: jid("bob@example.com"),
                node_id: Some("news".into()),
                jid: Some(jid("bob@example.com")),
                subscription_id: Some(info.subscription_id),
            })
            .await
            .unwrap();
        assert_eq!(form.value(fields::KEYWORDS), Some("rust"));
        assert!(form.field(fields::SUBSCRIPTION_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_requester_subscriptions_and_affiliations() {
        let (engine, _rx) = engine().await;
        create(&engine, "a", "alice@example.com", None).await;
        create(&engine, "b", "alice@example.com", None).await;
        engine
            .subscribe(subscribe(Some("b"), "bob@example.com", None))
            .await
            .unwrap();

        let bob = |node_id: Option<&str>| GetSubscriptions {
            from: jid("bob@example.com/laptop"),
            node_id: node_id.map(str::to_string),
        };
        let all = engine.get_subscriptions(bob(None)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].node_id, "b");
        assert!(engine.get_subscriptions(bob(Some("a"))).await.unwrap().is_empty());
        assert_eq!(
            engine.get_subscriptions(bob(Some("zz"))).await,
            Err(PubSubError::NodeNotFound("zz".into()))
        );

        let owned = engine
            .get_affiliations(GetAffiliations {
                from: jid("alice@example.com"),
                node_id: None,
            })
            .await
            .unwrap();
        let owned: Vec<(&str, Affiliation)> = owned
            .iter()
            .map(|a| (a.node_id.as_str(), a.affiliation))
            .collect();
        assert_eq!(owned, vec![("a", Affiliation::Owner), ("b", Affiliation::Owner)]);

        let none = engine
            .get_affiliations(GetAffiliations {
                from: jid("eve@example.com"),
                node_id: None,
            })
            .await;
        assert!(matches!(none, Err(PubSubError::ItemNotFound(_))));
    }
}

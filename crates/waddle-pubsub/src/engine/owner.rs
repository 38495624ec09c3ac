//! Owner use cases: managing the subscriptions and affiliations of a node.

use jid::BareJid;
use tracing::{debug, info, instrument, warn};

use crate::engine::{
    AffiliationInfo, AnswerAuthorization, GetNodeAffiliations, GetNodeSubscriptions,
    GetPendingSubscriptions, ModifyNodeAffiliations, ModifyNodeSubscriptions, PubSubEngine,
    SubscriptionInfo,
};
use crate::error::PubSubError;
use crate::types::{Affiliation, SubscriptionState};

impl PubSubEngine {
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn get_node_subscriptions(
        &self,
        req: GetNodeSubscriptions,
    ) -> Result<Vec<SubscriptionInfo>, PubSubError> {
        self.ensure_available()?;
        let node = self.require_node(req.node_id.as_deref())?;
        self.require_admin(&node, &req.from).await?;
        let state = node.read().await;
        let mut subscriptions: Vec<SubscriptionInfo> =
            state.core().subscriptions().map(SubscriptionInfo::from).collect();
        subscriptions.sort_by(|a, b| a.jid.to_string().cmp(&b.jid.to_string()));
        Ok(subscriptions)
    }

    /// Apply owner-side subscription changes. `none` cancels, `subscribed`
    /// approves a pending subscription or creates a new one. Other states
    /// are ignored.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from, changes = req.changes.len()))]
    pub async fn modify_node_subscriptions(
        &self,
        req: ModifyNodeSubscriptions,
    ) -> Result<(), PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        self.require_admin(&node, &req.from).await?;

        let mut state = node.write().await;
        state.ensure_live()?;
        for change in req.changes {
            let existing = if service.multiple_subscriptions_enabled() {
                change
                    .subscription_id
                    .as_deref()
                    .and_then(|id| state.core().subscription(id))
            } else {
                state.core().subscription_by_jid(&change.jid)
            }
            .map(|s| s.id().to_string());

            match (change.state, existing) {
                (SubscriptionState::None, Some(id)) => {
                    state.cancel_subscription(service, &id, true).await;
                }
                (SubscriptionState::Subscribed, Some(id)) => {
                    state.approve_subscription(service, &id, true).await;
                }
                (SubscriptionState::Subscribed, None) => {
                    let owner = change.jid.to_bare();
                    state
                        .create_subscription(service, &owner, &change.jid, false, None)
                        .await;
                }
                (other, _) => {
                    debug!(jid = %change.jid, state = %other, "Ignoring subscription change");
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn get_node_affiliations(
        &self,
        req: GetNodeAffiliations,
    ) -> Result<Vec<AffiliationInfo>, PubSubError> {
        self.ensure_available()?;
        let node = self.require_node(req.node_id.as_deref())?;
        self.require_admin(&node, &req.from).await?;
        let state = node.read().await;
        let mut affiliations: Vec<AffiliationInfo> = state
            .core()
            .affiliates()
            .map(|a| AffiliationInfo {
                node_id: node.id().to_string(),
                jid: a.jid().clone(),
                affiliation: a.affiliation(),
            })
            .collect();
        affiliations.sort_by(|a, b| a.jid.to_string().cmp(&b.jid.to_string()));
        Ok(affiliations)
    }

    /// Apply owner-side affiliation changes. Demoting the sole owner is
    /// refused; the remaining changes still apply and the refused JIDs are
    /// reported in a `NotAcceptable` error.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from, changes = req.changes.len()))]
    pub async fn modify_node_affiliations(
        &self,
        req: ModifyNodeAffiliations,
    ) -> Result<(), PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        self.require_admin(&node, &req.from).await?;

        let mut state = node.write().await;
        state.ensure_live()?;
        let mut refused: Vec<BareJid> = Vec::new();
        for change in req.changes {
            let current = state.core().affiliate(&change.jid).map(|a| a.affiliation());
            if current == Some(Affiliation::Owner)
                && change.affiliation != Affiliation::Owner
                && state.core().owners().len() == 1
            {
                refused.push(change.jid);
                continue;
            }
            match change.affiliation {
                Affiliation::Owner => state.add_owner(service, &change.jid).await,
                Affiliation::Publisher => state.add_publisher(service, &change.jid).await,
                Affiliation::None => state.add_none_affiliation(service, &change.jid).await,
                Affiliation::Outcast => state.add_outcast(service, &change.jid).await,
            }
            debug!(jid = %change.jid, affiliation = %change.affiliation, "Affiliation changed");
        }

        if refused.is_empty() {
            return Ok(());
        }
        let refused: Vec<String> = refused.iter().map(ToString::to_string).collect();
        warn!(node = %node.id(), refused = ?refused, "Refused to remove the last owner");
        Err(PubSubError::not_acceptable(format!(
            "node must keep an owner: {}",
            refused.join(", ")
        )))
    }

    /// An owner's answer to an authorization request.
    #[instrument(skip(self, req), fields(node = %req.node_id, from = %req.from, allow = req.allow))]
    pub async fn answer_authorization(&self, req: AnswerAuthorization) -> Result<(), PubSubError> {
        self.ensure_available()?;
        let node = self.require_node(Some(&req.node_id))?;
        self.require_admin(&node, &req.from).await?;
        let mut state = node.write().await;
        state.ensure_live()?;
        if state.core().subscription(&req.subscription_id).is_none() {
            return Err(PubSubError::SubscriptionNotFound(req.subscription_id));
        }
        state
            .approve_subscription(&self.service, &req.subscription_id, req.allow)
            .await;
        info!(
            node = %node.id(),
            subscription = %req.subscription_id,
            approved = req.allow,
            "Authorization answered"
        );
        Ok(())
    }

    /// Pending subscriptions of every node `from` owns.
    #[instrument(skip(self, req), fields(from = %req.from))]
    pub async fn get_pending_subscriptions(
        &self,
        req: GetPendingSubscriptions,
    ) -> Result<Vec<SubscriptionInfo>, PubSubError> {
        self.ensure_available()?;
        let owner = req.from.to_bare();
        let mut pending = Vec::new();
        for node in self.service.nodes() {
            let state = node.read().await;
            if state.ensure_live().is_err() || !state.core().owners().contains(&owner) {
                continue;
            }
            pending.extend(
                state
                    .core()
                    .pending_subscriptions()
                    .into_iter()
                    .map(SubscriptionInfo::from),
            );
        }
        pending.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{create, drain, engine, jid};
    use crate::engine::{AffiliationChange, Subscribe, SubscriptionChange};
    use crate::form::DataForm;
    use crate::node::config::fields;

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    async fn authorize_node(engine: &PubSubEngine) {
        let form = DataForm::submit().with_field(fields::ACCESS_MODEL, ["authorize"]);
        create(engine, "news", "alice@example.com", Some(form)).await;
    }

    async fn subscribe_bob(engine: &PubSubEngine) -> SubscriptionInfo {
        engine
            .subscribe(Subscribe {
                from: jid("bob@example.com"),
                node_id: Some("news".into()),
                jid: Some(jid("bob@example.com")),
                options: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_owner_views_require_admin() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let result = engine
            .get_node_subscriptions(GetNodeSubscriptions {
                from: jid("bob@example.com"),
                node_id: Some("news".into()),
            })
            .await;
        assert!(matches!(result, Err(PubSubError::Forbidden(_))));

        let affiliations = engine
            .get_node_affiliations(GetNodeAffiliations {
                from: jid("alice@example.com/desk"),
                node_id: Some("news".into()),
            })
            .await
            .unwrap();
        assert_eq!(affiliations.len(), 1);
        assert_eq!(affiliations[0].affiliation, Affiliation::Owner);
    }

    #[tokio::test]
    async fn test_answer_authorization() {
        let (engine, mut rx) = engine().await;
        authorize_node(&engine).await;
        let info = subscribe_bob(&engine).await;
        assert_eq!(info.state, SubscriptionState::Pending);

        let pending = engine
            .get_pending_subscriptions(GetPendingSubscriptions {
                from: jid("alice@example.com"),
            })
            .await
            .unwrap();
        assert_eq!(pending, vec![info.clone()]);

        let answer = |subscription_id: &str, from: &str| AnswerAuthorization {
            from: jid(from),
            node_id: "news".into(),
            subscription_id: subscription_id.to_string(),
            allow: true,
        };
        assert!(matches!(
            engine.answer_authorization(answer(&info.subscription_id, "bob@example.com")).await,
            Err(PubSubError::Forbidden(_))
        ));
        assert_eq!(
            engine.answer_authorization(answer("missing", "alice@example.com")).await,
            Err(PubSubError::SubscriptionNotFound("missing".into()))
        );
        drain(&mut rx);
        engine
            .answer_authorization(answer(&info.subscription_id, "alice@example.com"))
            .await
            .unwrap();

        let node = engine.service().node("news").unwrap();
        let state = node.read().await;
        let subscription = state.core().subscription(&info.subscription_id).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Subscribed);
    }

    #[tokio::test]
    async fn test_denied_authorization_cancels() {
        let (engine, _rx) = engine().await;
        authorize_node(&engine).await;
        let info = subscribe_bob(&engine).await;
        engine
            .answer_authorization(AnswerAuthorization {
                from: jid("alice@example.com"),
                node_id: "news".into(),
                subscription_id: info.subscription_id.clone(),
                allow: false,
            })
            .await
            .unwrap();
        let node = engine.service().node("news").unwrap();
        assert!(node.read().await.core().subscription(&info.subscription_id).is_none());
    }

    #[tokio::test]
    async fn test_modify_node_subscriptions() {
        let (engine, _rx) = engine().await;
        authorize_node(&engine).await;
        let pending = subscribe_bob(&engine).await;

        engine
            .modify_node_subscriptions(ModifyNodeSubscriptions {
                from: jid("alice@example.com"),
                node_id: Some("news".into()),
                changes: vec![
                    SubscriptionChange {
                        jid: jid("bob@example.com"),
                        state: SubscriptionState::Subscribed,
                        subscription_id: Some(pending.subscription_id.clone()),
                    },
                    SubscriptionChange {
                        jid: jid("carol@example.com"),
                        state: SubscriptionState::Subscribed,
                        subscription_id: None,
                    },
                ],
            })
            .await
            .unwrap();

        let subscriptions = engine
            .get_node_subscriptions(GetNodeSubscriptions {
                from: jid("alice@example.com"),
                node_id: Some("news".into()),
            })
            .await
            .unwrap();
        assert_eq!(subscriptions.len(), 3);
        assert!(subscriptions
            .iter()
            .all(|s| s.state == SubscriptionState::Subscribed));

        engine
            .modify_node_subscriptions(ModifyNodeSubscriptions {
                from: jid("alice@example.com"),
                node_id: Some("news".into()),
                changes: vec![SubscriptionChange {
                    jid: jid("bob@example.com"),
                    state: SubscriptionState::None,
                    subscription_id: Some(pending.subscription_id.clone()),
                }],
            })
            .await
            .unwrap();
        let node = engine.service().node("news").unwrap();
        assert!(node.read().await.core().subscription(&pending.subscription_id).is_none());
    }

    #[tokio::test]
    async fn test_last_owner_is_kept() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let result = engine
            .modify_node_affiliations(ModifyNodeAffiliations {
                from: jid("alice@example.com"),
                node_id: Some("news".into()),
                changes: vec![
                    AffiliationChange {
                        jid: bare("alice@example.com"),
                        affiliation: Affiliation::None,
                    },
                    AffiliationChange {
                        jid: bare("bob@example.com"),
                        affiliation: Affiliation::Publisher,
                    },
                ],
            })
            .await;
        assert!(matches!(result, Err(PubSubError::NotAcceptable(_))));

        let node = engine.service().node("news").unwrap();
        let state = node.read().await;
        assert_eq!(state.core().owners(), vec![bare("alice@example.com")]);
        assert_eq!(state.core().publishers(), vec![bare("bob@example.com")]);
    }

    #[tokio::test]
    async fn test_outcast_loses_subscriptions() {
        let (engine, _rx) = engine().await;
        create(&engine, "news", "alice@example.com", None).await;
        let info = subscribe_bob(&engine).await;
        engine
            .modify_node_affiliations(ModifyNodeAffiliations {
                from: jid("alice@example.com"),
                node_id: Some("news".into()),
                changes: vec![AffiliationChange {
                    jid: bare("bob@example.com"),
                    affiliation: Affiliation::Outcast,
                }],
            })
            .await
            .unwrap();
        {
            let node = engine.service().node("news").unwrap();
            let state = node.read().await;
            assert!(state.core().subscription(&info.subscription_id).is_none());
        }
        let again = engine
            .subscribe(Subscribe {
                from: jid("bob@example.com"),
                node_id: Some("news".into()),
                jid: Some(jid("bob@example.com")),
                options: None,
            })
            .await;
        assert!(matches!(again, Err(PubSubError::Forbidden(_))));
    }
}

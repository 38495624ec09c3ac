//! Affiliation and subscription lifecycle of a node.

use jid::{BareJid, Jid};
use tracing::debug;

use crate::cluster::ClusterTask;
use crate::form::DataForm;
use crate::item::{generate_id, SUBSCRIPTION_ID_LENGTH};
use crate::node::{NodeAffiliate, NodeState, NodeSubscription};
use crate::persistence::log_failure;
use crate::ports::Notification;
use crate::service::PubSubService;
use crate::types::{Affiliation, SubscriptionState};

impl NodeState {
    /// Create or update the affiliation of `jid`.
    async fn set_affiliation(
        &mut self,
        service: &PubSubService,
        jid: &BareJid,
        affiliation: Affiliation,
    ) {
        let existing = self.core.affiliates.get(jid).map(|a| a.affiliation());
        if existing == Some(affiliation) {
            return;
        }
        let affiliate = NodeAffiliate::new(jid.clone(), affiliation);
        self.core.affiliates.insert(jid.clone(), affiliate.clone());
        if self.core.saved {
            let store = service.persistence();
            let result = match existing {
                Some(_) => store.update_affiliation(&self.core.id, &affiliate).await,
                None => store.create_affiliation(&self.core.id, &affiliate).await,
            };
            log_failure(result, "save_affiliation", &self.core.id);
        }
        service.send_cluster_task(ClusterTask::AffiliationChanged {
            service_id: self.core.service_id.clone(),
            node_id: self.core.id.clone(),
            jid: jid.clone(),
            affiliation,
        });
    }

    /// Delete the affiliation of `jid` if it currently is `affiliation`.
    async fn remove_affiliation(
        &mut self,
        service: &PubSubService,
        jid: &BareJid,
        affiliation: Affiliation,
    ) {
        let matches = self
            .core
            .affiliates
            .get(jid)
            .is_some_and(|a| a.affiliation() == affiliation);
        if !matches {
            return;
        }
        self.core.affiliates.remove(jid);
        if self.core.saved {
            log_failure(
                service
                    .persistence()
                    .remove_affiliation(&self.core.id, jid)
                    .await,
                "remove_affiliation",
                &self.core.id,
            );
        }
    }

    /// Grant a publishing affiliation. The entity gets a default
    /// subscription if it has none; its pending subscriptions are approved.
    async fn grant(&mut self, service: &PubSubService, jid: &BareJid, affiliation: Affiliation) {
        self.set_affiliation(service, jid, affiliation).await;
        let subscriptions: Vec<(String, bool)> = self
            .core
            .subscriptions_of(jid)
            .into_iter()
            .map(|s| (s.id().to_string(), s.is_authorization_pending()))
            .collect();
        if subscriptions.is_empty() {
            self.create_subscription(service, jid, &Jid::from(jid.clone()), false, None)
                .await;
            return;
        }
        for (id, pending) in subscriptions {
            if pending {
                self.approve_subscription(service, &id, true).await;
            }
        }
    }

    /// Demote an entity: drop the affiliation when it holds no subscription,
    /// otherwise keep it as `none`.
    async fn revoke(&mut self, service: &PubSubService, jid: &BareJid, affiliation: Affiliation) {
        if self.core.subscriptions_of(jid).is_empty() {
            self.remove_affiliation(service, jid, affiliation).await;
        } else {
            self.add_none_affiliation(service, jid).await;
        }
    }

    pub(crate) async fn add_owner(&mut self, service: &PubSubService, jid: &BareJid) {
        self.grant(service, jid, Affiliation::Owner).await;
    }

    pub(crate) async fn remove_owner(&mut self, service: &PubSubService, jid: &BareJid) {
        self.revoke(service, jid, Affiliation::Owner).await;
    }

    pub(crate) async fn add_publisher(&mut self, service: &PubSubService, jid: &BareJid) {
        self.grant(service, jid, Affiliation::Publisher).await;
    }

    pub(crate) async fn remove_publisher(&mut self, service: &PubSubService, jid: &BareJid) {
        self.revoke(service, jid, Affiliation::Publisher).await;
    }

    pub(crate) async fn add_none_affiliation(&mut self, service: &PubSubService, jid: &BareJid) {
        self.set_affiliation(service, jid, Affiliation::None).await;
    }

    /// Ban an entity. Its subscriptions are cancelled.
    pub(crate) async fn add_outcast(&mut self, service: &PubSubService, jid: &BareJid) {
        self.set_affiliation(service, jid, Affiliation::Outcast).await;
        let ids: Vec<String> = self
            .core
            .subscriptions_of(jid)
            .into_iter()
            .map(|s| s.id().to_string())
            .collect();
        for id in ids {
            self.cancel_subscription(service, &id, true).await;
        }
    }

    pub(crate) async fn remove_outcast(&mut self, service: &PubSubService, jid: &BareJid) {
        self.remove_affiliation(service, jid, Affiliation::Outcast).await;
    }

    /// State a subscription moves to once it is configured.
    fn configured_state(&self, service: &PubSubService, owner: &BareJid) -> SubscriptionState {
        let owner_is_admin = self.core.is_admin(service, &Jid::from(owner.clone()));
        if self.core.config.access_model.is_authorization_required() && !owner_is_admin {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Subscribed
        }
    }

    /// Create a subscription of `owner`, delivered to `jid`.
    pub(crate) async fn create_subscription(
        &mut self,
        service: &PubSubService,
        owner: &BareJid,
        jid: &Jid,
        authorization_required: bool,
        options: Option<&DataForm>,
    ) -> NodeSubscription {
        if self.core.affiliate(owner).is_none() {
            self.add_none_affiliation(service, owner).await;
        }
        let owner_is_admin = self.core.is_admin(service, &Jid::from(owner.clone()));
        let state = if self.core.config.subscription_configuration_required {
            SubscriptionState::Unconfigured
        } else if authorization_required && !owner_is_admin {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Subscribed
        };

        let mut id = generate_id(SUBSCRIPTION_ID_LENGTH);
        while self.core.subscriptions.contains_key(&id) {
            id = generate_id(SUBSCRIPTION_ID_LENGTH);
        }
        let mut subscription =
            NodeSubscription::new(id, self.core.id.clone(), owner.clone(), jid.clone(), state);
        if let Some(options) = options {
            let next_state = self.configured_state(service, owner);
            subscription.apply_options(options, self.core.is_collection(), next_state);
        }
        self.core.insert_subscription(subscription.clone());

        if self.core.saved {
            log_failure(
                service
                    .persistence()
                    .create_subscription(&self.core.id, &subscription)
                    .await,
                "create_subscription",
                &self.core.id,
            );
        }
        if subscription.is_authorization_pending() {
            self.send_authorization_request(service, &subscription);
        }
        service.send_cluster_task(ClusterTask::NewSubscription {
            service_id: self.core.service_id.clone(),
            node_id: self.core.id.clone(),
            subscription: subscription.clone(),
        });
        if self.kind.is_send_item_subscribe() && subscription.is_active() {
            self.send_last_published_item(service, &subscription);
        }
        self.sync_presence(service, owner);
        debug!(
            node = %self.core.id,
            subscription = %subscription.id(),
            jid = %jid,
            state = %subscription.state(),
            "Subscription created"
        );
        subscription
    }

    /// Remove a subscription. A `none` affiliation without remaining
    /// subscriptions is removed too.
    pub(crate) async fn cancel_subscription(
        &mut self,
        service: &PubSubService,
        id: &str,
        send_to_cluster: bool,
    ) -> Option<NodeSubscription> {
        let subscription = self.core.take_subscription(id)?;
        let owner = subscription.owner().clone();
        if self.core.subscriptions_of(&owner).is_empty() {
            self.remove_affiliation(service, &owner, Affiliation::None).await;
        }
        if self.core.saved {
            log_failure(
                service
                    .persistence()
                    .remove_subscription(&self.core.id, id)
                    .await,
                "remove_subscription",
                &self.core.id,
            );
        }
        if send_to_cluster {
            service.send_cluster_task(ClusterTask::CancelSubscription {
                service_id: self.core.service_id.clone(),
                node_id: self.core.id.clone(),
                subscription_id: id.to_string(),
            });
        }
        self.sync_presence(service, &owner);
        debug!(node = %self.core.id, subscription = %id, "Subscription cancelled");
        Some(subscription)
    }

    /// Owner decision on a pending subscription. Other states are left alone.
    pub(crate) async fn approve_subscription(
        &mut self,
        service: &PubSubService,
        id: &str,
        approved: bool,
    ) {
        let pending = self
            .core
            .subscriptions
            .get(id)
            .is_some_and(NodeSubscription::is_authorization_pending);
        if !pending {
            return;
        }
        if !approved {
            self.cancel_subscription(service, id, true).await;
            return;
        }
        let Some(subscription) = self.core.subscriptions.get_mut(id) else {
            return;
        };
        subscription.set_state(SubscriptionState::Subscribed);
        let subscription = subscription.clone();
        self.subscription_modified(service, &subscription).await;
        if self.kind.is_send_item_subscribe() && subscription.is_active() {
            self.send_last_published_item(service, &subscription);
        }
    }

    /// Apply a submitted subscription options form.
    pub(crate) async fn configure_subscription(
        &mut self,
        service: &PubSubService,
        id: &str,
        form: &DataForm,
    ) -> Option<NodeSubscription> {
        let owner = self.core.subscriptions.get(id)?.owner().clone();
        let next_state = self.configured_state(service, &owner);
        let on_collection = self.core.is_collection();
        let subscription = self.core.subscriptions.get_mut(id)?;
        let was_unconfigured = subscription.is_configuration_pending();
        let was_active = subscription.is_active();
        subscription.apply_options(form, on_collection, next_state);
        let subscription = subscription.clone();

        self.subscription_modified(service, &subscription).await;
        self.sync_presence(service, &owner);
        if was_unconfigured && subscription.is_authorization_pending() {
            self.send_authorization_request(service, &subscription);
        }
        if !was_active && subscription.is_active() && self.kind.is_send_item_subscribe() {
            self.send_last_published_item(service, &subscription);
        }
        Some(subscription)
    }

    async fn subscription_modified(&self, service: &PubSubService, subscription: &NodeSubscription) {
        if self.core.saved {
            log_failure(
                service
                    .persistence()
                    .update_subscription(&self.core.id, subscription)
                    .await,
                "update_subscription",
                &self.core.id,
            );
        }
        service.send_cluster_task(ClusterTask::ModifySubscription {
            service_id: self.core.service_id.clone(),
            node_id: self.core.id.clone(),
            subscription: subscription.clone(),
        });
    }

    /// Ask every owner to approve a pending subscription.
    fn send_authorization_request(&self, service: &PubSubService, subscription: &NodeSubscription) {
        let notification = Notification::AuthorizationRequest {
            node_id: self.core.id.clone(),
            subscription_id: subscription.id().to_string(),
            subscriber: subscription.jid().clone(),
        };
        let owners: Vec<Jid> = self.core.owners().into_iter().map(Jid::from).collect();
        service.broadcast(&self.core.id, notification, &owners);
    }
}

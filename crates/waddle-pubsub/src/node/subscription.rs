//! Node subscriptions and their delivery options.

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::form::{DataForm, FormField, FormType};
use crate::item::PublishedItem;
use crate::ports::PresencePort;
use crate::types::{SubscriptionState, SubscriptionType};

/// `FORM_TYPE` of subscription options forms.
pub const SUBSCRIBE_OPTIONS_NS: &str = "http://jabber.org/protocol/pubsub#subscribe_options";

/// Field names of the subscription options form.
pub mod fields {
    pub const DELIVER: &str = "pubsub#deliver";
    pub const DIGEST: &str = "pubsub#digest";
    pub const DIGEST_FREQUENCY: &str = "pubsub#digest_frequency";
    pub const EXPIRE: &str = "pubsub#expire";
    pub const INCLUDE_BODY: &str = "pubsub#include_body";
    pub const SHOW_VALUES: &str = "pubsub#show-values";
    pub const SUBSCRIPTION_TYPE: &str = "pubsub#subscription_type";
    pub const SUBSCRIPTION_DEPTH: &str = "pubsub#subscription_depth";
    pub const KEYWORDS: &str = "x-pubsub#keywords";
}

/// Default digest frequency in milliseconds (one day).
pub const DEFAULT_DIGEST_FREQUENCY: u64 = 86_400_000;

/// Delivery preferences of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// Whether notifications are delivered at all.
    pub deliver: bool,
    pub digest: bool,
    /// Digest frequency in milliseconds.
    pub digest_frequency: u64,
    /// After this instant the subscription is no longer active.
    pub expire: Option<DateTime<Utc>>,
    pub include_body: bool,
    /// Presence show values that allow delivery. Empty means any.
    pub show_values: Vec<String>,
    /// Only items whose payload contains this text are delivered.
    pub keyword: Option<String>,
    /// Collection subscriptions only: item or node events.
    pub subscription_type: SubscriptionType,
    /// Collection subscriptions only: 1 for direct children, 0 for any descendant.
    pub depth: u32,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            deliver: true,
            digest: false,
            digest_frequency: DEFAULT_DIGEST_FREQUENCY,
            expire: None,
            include_body: false,
            show_values: Vec::new(),
            keyword: None,
            subscription_type: SubscriptionType::default(),
            depth: 1,
        }
    }
}

impl SubscriptionOptions {
    /// Apply one options field. Returns `true` when the field is recognized.
    fn apply_field(&mut self, field: &FormField, on_collection: bool) -> bool {
        match field.var.as_str() {
            fields::DELIVER => self.deliver = field.as_bool(),
            fields::DIGEST => self.digest = field.as_bool(),
            fields::DIGEST_FREQUENCY => match field.first().map(|v| v.trim().parse::<u64>()) {
                Some(Ok(frequency)) => self.digest_frequency = frequency,
                Some(Err(_)) => warn!(value = ?field.first(), "Ignoring invalid digest frequency"),
                None => {}
            },
            fields::EXPIRE => match field.first() {
                Some(value) if !value.trim().is_empty() => {
                    match DateTime::parse_from_rfc3339(value.trim()) {
                        Ok(expire) => self.expire = Some(expire.with_timezone(&Utc)),
                        Err(e) => warn!(value = %value, error = %e, "Ignoring invalid expire date"),
                    }
                }
                _ => self.expire = None,
            },
            fields::INCLUDE_BODY => self.include_body = field.as_bool(),
            fields::SHOW_VALUES => self.show_values = field.values.clone(),
            fields::KEYWORDS => {
                self.keyword = field
                    .first()
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
            }
            fields::SUBSCRIPTION_TYPE if on_collection => {
                if let Some(kind) = field.first().and_then(SubscriptionType::from_str) {
                    self.subscription_type = kind;
                }
            }
            fields::SUBSCRIPTION_DEPTH if on_collection => match field.first() {
                Some("all") => self.depth = 0,
                Some(value) => match value.trim().parse::<u32>() {
                    Ok(depth) => self.depth = depth,
                    Err(_) => warn!(value = %value, "Ignoring invalid subscription depth"),
                },
                None => {}
            },
            _ => return false,
        }
        true
    }
}

/// Presence information needed to decide whether an event may be sent.
#[derive(Clone, Copy)]
pub(crate) struct DeliveryContext<'a> {
    pub presence: &'a dyn PresencePort,
    /// Whether the subscribed node only delivers to online entities.
    pub presence_based_delivery: bool,
    /// Distance from the subscribed collection down to the node the event
    /// originates from. `None` when the subscription is on that node itself.
    pub collection_distance: Option<usize>,
}

/// A subscription to a node.
///
/// `owner` is the affiliated entity; `jid` is where notifications go and may
/// be a full JID of the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSubscription {
    id: String,
    node_id: String,
    owner: BareJid,
    jid: Jid,
    state: SubscriptionState,
    options: SubscriptionOptions,
}

impl NodeSubscription {
    pub fn new(
        id: impl Into<String>,
        node_id: impl Into<String>,
        owner: BareJid,
        jid: Jid,
        state: SubscriptionState,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            owner,
            jid,
            state,
            options: SubscriptionOptions::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn owner(&self) -> &BareJid {
        &self.owner
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    pub(crate) fn set_state(&mut self, state: SubscriptionState) {
        self.state = state;
    }

    pub(crate) fn set_options(&mut self, options: SubscriptionOptions) {
        self.options = options;
    }

    /// Approved, configured and not expired.
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    pub(crate) fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.state != SubscriptionState::Subscribed {
            return false;
        }
        match self.options.expire {
            Some(expire) => now <= expire,
            None => true,
        }
    }

    pub fn is_authorization_pending(&self) -> bool {
        self.state == SubscriptionState::Pending
    }

    pub fn is_configuration_pending(&self) -> bool {
        self.state == SubscriptionState::Unconfigured
    }

    /// Apply a submitted options form. When any recognized field is present
    /// the subscription moves to `next_state`. Returns whether that happened.
    pub(crate) fn apply_options(
        &mut self,
        form: &DataForm,
        on_collection: bool,
        next_state: SubscriptionState,
    ) -> bool {
        let mut recognized = false;
        for field in &form.fields {
            recognized |= self.options.apply_field(field, on_collection);
        }
        if recognized {
            self.state = next_state;
        }
        recognized
    }

    /// Render the current options.
    pub fn options_form(&self, on_collection: bool) -> DataForm {
        let options = &self.options;
        let mut form = DataForm::new(FormType::Form).with_namespace(SUBSCRIBE_OPTIONS_NS);
        form.add_bool(fields::DELIVER, options.deliver);
        form.add_bool(fields::DIGEST, options.digest);
        form.add_field(fields::DIGEST_FREQUENCY, [options.digest_frequency.to_string()]);
        form.add_field(fields::EXPIRE, options.expire.map(|e| e.to_rfc3339()));
        form.add_bool(fields::INCLUDE_BODY, options.include_body);
        form.add_field(fields::SHOW_VALUES, options.show_values.iter().cloned());
        if on_collection {
            form.add_field(
                fields::SUBSCRIPTION_TYPE,
                [options.subscription_type.to_string()],
            );
            let depth = if options.depth == 0 {
                "all".to_string()
            } else {
                options.depth.to_string()
            };
            form.add_field(fields::SUBSCRIPTION_DEPTH, [depth]);
        }
        form.add_field(fields::KEYWORDS, options.keyword.clone());
        form
    }

    /// Whether `user` may modify or cancel this subscription: the delivery
    /// JID, the owning entity, or a service admin.
    pub fn can_modify(&self, user: &Jid, service_admin: bool) -> bool {
        service_admin
            || user == &self.jid
            || (user.resource().is_none() && user.to_bare() == self.owner)
    }

    /// Checks common to every kind of event.
    pub(crate) fn can_send_events(&self, ctx: &DeliveryContext<'_>) -> bool {
        if !self.is_active() || !self.options.deliver {
            return false;
        }
        let needs_presence = !self.options.show_values.is_empty() || ctx.presence_based_delivery;
        if !needs_presence {
            return true;
        }
        let shows = ctx.presence.show_presences(&self.jid);
        if shows.is_empty() {
            return false;
        }
        self.options.show_values.is_empty()
            || shows.iter().any(|show| self.options.show_values.contains(show))
    }

    /// Whether the event for a publication may be sent. `item` is `None` for
    /// publications without items.
    pub(crate) fn can_send_publication_event(
        &self,
        ctx: &DeliveryContext<'_>,
        item: Option<&PublishedItem>,
    ) -> bool {
        if !self.can_send_events(ctx) {
            return false;
        }
        if let Some(item) = item {
            if !self.is_keyword_matched(item) {
                return false;
            }
        }
        match ctx.collection_distance {
            None => true,
            Some(distance) => {
                self.options.subscription_type == SubscriptionType::Items
                    && self.within_depth(distance)
            }
        }
    }

    /// Whether a node-added or node-removed event may be sent to this
    /// collection subscription.
    pub(crate) fn can_send_child_node_event(&self, ctx: &DeliveryContext<'_>) -> bool {
        let Some(distance) = ctx.collection_distance else {
            return false;
        };
        self.can_send_events(ctx)
            && self.options.subscription_type == SubscriptionType::Nodes
            && self.within_depth(distance)
    }

    /// Configuration-changed, purge and delete events.
    pub(crate) fn can_send_node_events(&self, ctx: &DeliveryContext<'_>) -> bool {
        self.can_send_events(ctx)
    }

    pub(crate) fn is_keyword_matched(&self, item: &PublishedItem) -> bool {
        match self.options.keyword.as_deref() {
            None | Some("") => true,
            Some(keyword) => item.contains_keyword(keyword),
        }
    }

    fn within_depth(&self, distance: usize) -> bool {
        self.options.depth == 0 || distance <= self.options.depth as usize
    }
}

//! Node configuration.
//!
//! Common options live in [`NodeConfig`]; the leaf and collection variants
//! carry [`LeafConfig`] and [`CollectionConfig`]. Each knows how to apply a
//! submitted `pubsub#node_config` field and how to render itself back into a
//! form.

use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};

use crate::access::{AccessModel, PublisherModel};
use crate::error::PubSubError;
use crate::form::{DataForm, FormField, FormType};
use crate::types::{AssociationPolicy, ItemReplyPolicy, NodeType};

/// `FORM_TYPE` of node configuration forms.
pub const NODE_CONFIG_NS: &str = "http://jabber.org/protocol/pubsub#node_config";

/// Field names of the node configuration form.
pub mod fields {
    pub const DELIVER_PAYLOADS: &str = "pubsub#deliver_payloads";
    pub const NOTIFY_CONFIG: &str = "pubsub#notify_config";
    pub const NOTIFY_DELETE: &str = "pubsub#notify_delete";
    pub const NOTIFY_RETRACT: &str = "pubsub#notify_retract";
    pub const PRESENCE_BASED_DELIVERY: &str = "pubsub#presence_based_delivery";
    pub const SUBSCRIBE: &str = "pubsub#subscribe";
    pub const SUBSCRIPTION_REQUIRED: &str = "pubsub#subscription_required";
    pub const PAYLOAD_TYPE: &str = "pubsub#type";
    pub const BODY_XSLT: &str = "pubsub#body_xslt";
    pub const DATAFORM_XSLT: &str = "pubsub#dataform_xslt";
    pub const ACCESS_MODEL: &str = "pubsub#access_model";
    pub const PUBLISH_MODEL: &str = "pubsub#publish_model";
    pub const ROSTER_GROUPS_ALLOWED: &str = "pubsub#roster_groups_allowed";
    pub const CONTACT: &str = "pubsub#contact";
    pub const DESCRIPTION: &str = "pubsub#description";
    pub const LANGUAGE: &str = "pubsub#language";
    pub const TITLE: &str = "pubsub#title";
    pub const ITEM_REPLY: &str = "pubsub#itemreply";
    pub const REPLY_ROOM: &str = "pubsub#replyroom";
    pub const REPLY_TO: &str = "pubsub#replyto";
    pub const OWNER: &str = "pubsub#owner";
    pub const PUBLISHER: &str = "pubsub#publisher";
    pub const NODE_TYPE: &str = "pubsub#node_type";
    pub const COLLECTION: &str = "pubsub#collection";

    pub const PERSIST_ITEMS: &str = "pubsub#persist_items";
    pub const MAX_ITEMS: &str = "pubsub#max_items";
    pub const MAX_PAYLOAD_SIZE: &str = "pubsub#max_payload_size";
    pub const SEND_ITEM_SUBSCRIBE: &str = "pubsub#send_item_subscribe";

    pub const LEAF_ASSOCIATION_POLICY: &str = "pubsub#leaf_node_association_policy";
    pub const CHILDREN_ASSOCIATION_POLICY: &str = "pubsub#children_association_policy";
    pub const LEAF_ASSOCIATION_WHITELIST: &str = "pubsub#leaf_node_association_whitelist";
    pub const CHILDREN_ASSOCIATION_WHITELIST: &str = "pubsub#children_association_whitelist";
    pub const LEAF_NODES_MAX: &str = "pubsub#leaf_nodes_max";
    pub const CHILDREN_MAX: &str = "pubsub#children_max";
    pub const CHILDREN: &str = "pubsub#children";
}

/// Default `max_items` when a persisting leaf submits the field without a value.
pub const DEFAULT_MAX_ITEMS: i32 = 50;

/// Default maximum payload size in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: i32 = 5120;

/// Options shared by every node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub deliver_payloads: bool,
    pub notify_config_changes: bool,
    pub notify_delete: bool,
    pub notify_retract: bool,
    /// Deliver notifications only to subscribers that are online.
    pub presence_based_delivery: bool,
    pub subscription_enabled: bool,
    /// New subscriptions start `unconfigured` until options are submitted.
    pub subscription_configuration_required: bool,
    pub access_model: AccessModel,
    pub publisher_model: PublisherModel,
    pub reply_policy: Option<ItemReplyPolicy>,
    pub roster_groups_allowed: Vec<String>,
    pub payload_type: String,
    pub body_xslt: String,
    pub dataform_xslt: String,
    pub language: String,
    pub description: String,
    pub title: String,
    pub contacts: Vec<Jid>,
    pub reply_to: Vec<Jid>,
    pub reply_rooms: Vec<Jid>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf_default()
    }
}

impl NodeConfig {
    /// Built-in defaults for leaf nodes.
    pub fn leaf_default() -> Self {
        Self {
            deliver_payloads: true,
            notify_config_changes: true,
            notify_delete: true,
            notify_retract: true,
            presence_based_delivery: false,
            subscription_enabled: true,
            subscription_configuration_required: false,
            access_model: AccessModel::Open,
            publisher_model: PublisherModel::Publishers,
            reply_policy: None,
            roster_groups_allowed: Vec::new(),
            payload_type: String::new(),
            body_xslt: String::new(),
            dataform_xslt: String::new(),
            language: "English".to_string(),
            description: String::new(),
            title: String::new(),
            contacts: Vec::new(),
            reply_to: Vec::new(),
            reply_rooms: Vec::new(),
        }
    }

    /// Built-in defaults for collection nodes.
    pub fn collection_default() -> Self {
        Self {
            deliver_payloads: false,
            ..Self::leaf_default()
        }
    }

    /// Apply one submitted field. Returns `Ok(false)` for fields this struct
    /// does not own.
    pub(crate) fn apply_field(&mut self, field: &FormField) -> Result<bool, PubSubError> {
        match field.var.as_str() {
            fields::DELIVER_PAYLOADS => self.deliver_payloads = field.as_bool(),
            fields::NOTIFY_CONFIG => self.notify_config_changes = field.as_bool(),
            fields::NOTIFY_DELETE => self.notify_delete = field.as_bool(),
            fields::NOTIFY_RETRACT => self.notify_retract = field.as_bool(),
            fields::PRESENCE_BASED_DELIVERY => self.presence_based_delivery = field.as_bool(),
            fields::SUBSCRIBE => self.subscription_enabled = field.as_bool(),
            fields::SUBSCRIPTION_REQUIRED => {
                self.subscription_configuration_required = field.as_bool()
            }
            fields::PAYLOAD_TYPE => self.payload_type = first_or_empty(field),
            fields::BODY_XSLT => self.body_xslt = first_or_empty(field),
            fields::DATAFORM_XSLT => self.dataform_xslt = first_or_empty(field),
            fields::ACCESS_MODEL => {
                if let Some(value) = field.first() {
                    self.access_model = AccessModel::from_str(value).ok_or_else(|| {
                        PubSubError::bad_request(format!("unknown access model: {}", value))
                    })?;
                }
            }
            fields::PUBLISH_MODEL => {
                if let Some(value) = field.first() {
                    self.publisher_model = PublisherModel::from_str(value).ok_or_else(|| {
                        PubSubError::bad_request(format!("unknown publish model: {}", value))
                    })?;
                }
            }
            fields::ROSTER_GROUPS_ALLOWED => self.roster_groups_allowed = field.values.clone(),
            fields::CONTACT => self.contacts = parse_jids(field)?,
            fields::DESCRIPTION => self.description = first_or_empty(field),
            fields::LANGUAGE => self.language = first_or_empty(field),
            fields::TITLE => self.title = first_or_empty(field),
            fields::ITEM_REPLY => {
                self.reply_policy = match field.first() {
                    None | Some("") => None,
                    Some(value) => Some(ItemReplyPolicy::from_str(value).ok_or_else(|| {
                        PubSubError::bad_request(format!("unknown reply policy: {}", value))
                    })?),
                };
            }
            fields::REPLY_ROOM => self.reply_rooms = parse_jids(field)?,
            fields::REPLY_TO => self.reply_to = parse_jids(field)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub(crate) fn write_form(&self, form: &mut DataForm) {
        form.add_bool(fields::DELIVER_PAYLOADS, self.deliver_payloads);
        form.add_bool(fields::NOTIFY_CONFIG, self.notify_config_changes);
        form.add_bool(fields::NOTIFY_DELETE, self.notify_delete);
        form.add_bool(fields::NOTIFY_RETRACT, self.notify_retract);
        form.add_bool(fields::PRESENCE_BASED_DELIVERY, self.presence_based_delivery);
        form.add_bool(fields::SUBSCRIBE, self.subscription_enabled);
        form.add_bool(
            fields::SUBSCRIPTION_REQUIRED,
            self.subscription_configuration_required,
        );
        form.add_field(fields::PAYLOAD_TYPE, [self.payload_type.as_str()]);
        form.add_field(fields::BODY_XSLT, [self.body_xslt.as_str()]);
        form.add_field(fields::DATAFORM_XSLT, [self.dataform_xslt.as_str()]);
        form.add_field(fields::ACCESS_MODEL, [self.access_model.to_string()]);
        form.add_field(fields::PUBLISH_MODEL, [self.publisher_model.to_string()]);
        form.add_field(fields::ROSTER_GROUPS_ALLOWED, self.roster_groups_allowed.iter().cloned());
        form.add_field(fields::CONTACT, self.contacts.iter().map(|j| j.to_string()));
        form.add_field(fields::DESCRIPTION, [self.description.as_str()]);
        form.add_field(fields::LANGUAGE, [self.language.as_str()]);
        form.add_field(fields::TITLE, [self.title.as_str()]);
        form.add_field(
            fields::ITEM_REPLY,
            self.reply_policy.map(|p| p.to_string()),
        );
        form.add_field(fields::REPLY_ROOM, self.reply_rooms.iter().map(|j| j.to_string()));
        form.add_field(fields::REPLY_TO, self.reply_to.iter().map(|j| j.to_string()));
    }
}

/// Options specific to leaf nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafConfig {
    pub persist_items: bool,
    /// Retention limit; `-1` keeps everything.
    pub max_items: i32,
    pub max_payload_size: i32,
    /// Send the last published item to new subscribers.
    pub send_item_subscribe: bool,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            persist_items: false,
            max_items: -1,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            send_item_subscribe: true,
        }
    }
}

impl LeafConfig {
    /// Retention limit in effect. A non-persisting leaf keeps only the last item.
    pub fn effective_max_items(&self) -> Option<usize> {
        if !self.persist_items {
            Some(1)
        } else if self.max_items < 0 {
            None
        } else {
            Some(self.max_items as usize)
        }
    }

    /// Whether published payloads of `size` bytes are accepted.
    pub fn accepts_payload(&self, size: usize) -> bool {
        self.max_payload_size < 0 || size <= self.max_payload_size as usize
    }

    pub(crate) fn apply_field(&mut self, field: &FormField) -> Result<bool, PubSubError> {
        match field.var.as_str() {
            fields::PERSIST_ITEMS => self.persist_items = field.as_bool(),
            fields::MAX_ITEMS => {
                self.max_items = field
                    .as_i32_or(DEFAULT_MAX_ITEMS)
                    .map_err(PubSubError::BadRequest)?
            }
            fields::MAX_PAYLOAD_SIZE => {
                self.max_payload_size = field
                    .as_i32_or(DEFAULT_MAX_PAYLOAD_SIZE)
                    .map_err(PubSubError::BadRequest)?
            }
            fields::SEND_ITEM_SUBSCRIBE => self.send_item_subscribe = field.as_bool(),
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub(crate) fn write_form(&self, form: &mut DataForm) {
        let max_items = match self.effective_max_items() {
            Some(max) => max.to_string(),
            None => "-1".to_string(),
        };
        form.add_bool(fields::PERSIST_ITEMS, self.persist_items);
        form.add_field(fields::MAX_ITEMS, [max_items]);
        form.add_field(fields::MAX_PAYLOAD_SIZE, [self.max_payload_size.to_string()]);
        form.add_bool(fields::SEND_ITEM_SUBSCRIBE, self.send_item_subscribe);
    }
}

/// Options specific to collection nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub association_policy: AssociationPolicy,
    /// Entities allowed to associate under the whitelist policy.
    pub association_trusted: Vec<BareJid>,
    /// Maximum number of leaf children; `-1` means unlimited.
    pub max_leaf_nodes: i32,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            association_policy: AssociationPolicy::All,
            association_trusted: Vec::new(),
            max_leaf_nodes: -1,
        }
    }
}

impl CollectionConfig {
    pub(crate) fn apply_field(&mut self, field: &FormField) -> Result<bool, PubSubError> {
        match field.var.as_str() {
            fields::LEAF_ASSOCIATION_POLICY | fields::CHILDREN_ASSOCIATION_POLICY => {
                if let Some(value) = field.first() {
                    self.association_policy =
                        AssociationPolicy::from_str(value).ok_or_else(|| {
                            PubSubError::bad_request(format!(
                                "unknown association policy: {}",
                                value
                            ))
                        })?;
                }
            }
            fields::LEAF_ASSOCIATION_WHITELIST | fields::CHILDREN_ASSOCIATION_WHITELIST => {
                self.association_trusted = parse_jids(field)?
                    .into_iter()
                    .map(|jid| jid.to_bare())
                    .collect();
            }
            fields::LEAF_NODES_MAX | fields::CHILDREN_MAX => {
                self.max_leaf_nodes = field.as_i32_or(-1).map_err(PubSubError::BadRequest)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub(crate) fn write_form(&self, form: &mut DataForm) {
        form.add_field(
            fields::LEAF_ASSOCIATION_POLICY,
            [self.association_policy.to_string()],
        );
        form.add_field(
            fields::LEAF_ASSOCIATION_WHITELIST,
            self.association_trusted.iter().map(|j| j.to_string()),
        );
        form.add_field(fields::LEAF_NODES_MAX, [self.max_leaf_nodes.to_string()]);
    }
}

/// Service-wide defaults applied to newly created nodes of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultNodeConfiguration {
    pub node_type: NodeType,
    pub config: NodeConfig,
    /// Present for leaf defaults.
    pub leaf: Option<LeafConfig>,
    /// Present for collection defaults.
    pub collection: Option<CollectionConfig>,
}

impl DefaultNodeConfiguration {
    /// Built-in leaf defaults.
    pub fn leaf() -> Self {
        Self {
            node_type: NodeType::Leaf,
            config: NodeConfig::leaf_default(),
            leaf: Some(LeafConfig::default()),
            collection: None,
        }
    }

    /// Built-in collection defaults.
    pub fn collection() -> Self {
        Self {
            node_type: NodeType::Collection,
            config: NodeConfig::collection_default(),
            leaf: None,
            collection: Some(CollectionConfig::default()),
        }
    }

    /// Built-in defaults for a node type.
    pub fn builtin(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Leaf => Self::leaf(),
            NodeType::Collection => Self::collection(),
        }
    }

    /// Render as a configuration form.
    pub fn to_form(&self) -> DataForm {
        let mut form = DataForm::new(FormType::Form).with_namespace(NODE_CONFIG_NS);
        form.add_field(fields::NODE_TYPE, [self.node_type.to_string()]);
        self.config.write_form(&mut form);
        if let Some(leaf) = &self.leaf {
            leaf.write_form(&mut form);
        }
        if let Some(collection) = &self.collection {
            collection.write_form(&mut form);
        }
        form
    }
}

fn first_or_empty(field: &FormField) -> String {
    field.first().unwrap_or_default().to_string()
}

/// Parse every value of a field as a JID.
pub(crate) fn parse_jids(field: &FormField) -> Result<Vec<Jid>, PubSubError> {
    field
        .values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.trim()
                .parse::<Jid>()
                .map_err(|_| PubSubError::bad_request(format!("{}: invalid JID: {}", field.var, v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_defaults() {
        let defaults = DefaultNodeConfiguration::leaf();
        let leaf = defaults.leaf.as_ref().unwrap();
        assert!(defaults.config.deliver_payloads);
        assert_eq!(defaults.config.access_model, AccessModel::Open);
        assert_eq!(defaults.config.publisher_model, PublisherModel::Publishers);
        assert_eq!(defaults.config.language, "English");
        assert!(!leaf.persist_items);
        assert_eq!(leaf.max_items, -1);
        assert_eq!(leaf.max_payload_size, 5120);
        assert!(leaf.send_item_subscribe);
    }

    #[test]
    fn test_collection_defaults() {
        let defaults = DefaultNodeConfiguration::collection();
        assert!(!defaults.config.deliver_payloads);
        let collection = defaults.collection.as_ref().unwrap();
        assert_eq!(collection.association_policy, AssociationPolicy::All);
        assert_eq!(collection.max_leaf_nodes, -1);
    }

    #[test]
    fn test_effective_max_items() {
        let mut leaf = LeafConfig::default();
        assert_eq!(leaf.effective_max_items(), Some(1));
        leaf.persist_items = true;
        assert_eq!(leaf.effective_max_items(), None);
        leaf.max_items = 3;
        assert_eq!(leaf.effective_max_items(), Some(3));
    }

    #[test]
    fn test_apply_common_fields() {
        let mut config = NodeConfig::leaf_default();
        let access = FormField::new(fields::ACCESS_MODEL, ["whitelist"]);
        let notify = FormField::new(fields::NOTIFY_RETRACT, ["0"]);
        let contact = FormField::new(fields::CONTACT, ["admin@example.com"]);
        let unknown = FormField::new("pubsub#max_items", ["3"]);

        assert_eq!(config.apply_field(&access), Ok(true));
        assert_eq!(config.apply_field(&notify), Ok(true));
        assert_eq!(config.apply_field(&contact), Ok(true));
        assert_eq!(config.apply_field(&unknown), Ok(false));
        assert_eq!(config.access_model, AccessModel::Whitelist);
        assert!(!config.notify_retract);
        assert_eq!(config.contacts.len(), 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = NodeConfig::leaf_default();
        let bad = FormField::new(fields::ACCESS_MODEL, ["everyone"]);
        assert!(matches!(config.apply_field(&bad), Err(PubSubError::BadRequest(_))));

        let mut leaf = LeafConfig::default();
        let bad = FormField::new(fields::MAX_ITEMS, ["lots"]);
        assert!(leaf.apply_field(&bad).is_err());
    }

    #[test]
    fn test_max_items_without_value_defaults() {
        let mut leaf = LeafConfig::default();
        let field = FormField::new(fields::MAX_ITEMS, Vec::<String>::new());
        leaf.apply_field(&field).unwrap();
        assert_eq!(leaf.max_items, DEFAULT_MAX_ITEMS);
    }

    #[test]
    fn test_collection_alias_fields() {
        let mut collection = CollectionConfig::default();
        collection
            .apply_field(&FormField::new(fields::CHILDREN_ASSOCIATION_POLICY, ["owners"]))
            .unwrap();
        collection
            .apply_field(&FormField::new(fields::CHILDREN_MAX, ["2"]))
            .unwrap();
        assert_eq!(collection.association_policy, AssociationPolicy::Owners);
        assert_eq!(collection.max_leaf_nodes, 2);
    }

    #[test]
    fn test_default_form_rendering() {
        let form = DefaultNodeConfiguration::leaf().to_form();
        assert_eq!(form.form_namespace.as_deref(), Some(NODE_CONFIG_NS));
        assert_eq!(form.value(fields::NODE_TYPE), Some("leaf"));
        assert_eq!(form.value(fields::ACCESS_MODEL), Some("open"));
        assert_eq!(form.value(fields::MAX_ITEMS), Some("1"));
        assert_eq!(form.value(fields::SEND_ITEM_SUBSCRIBE), Some("1"));
    }

    #[test]
    fn test_defaults_serde_roundtrip() {
        let defaults = DefaultNodeConfiguration::collection();
        let json = serde_json::to_string(&defaults).unwrap();
        let parsed: DefaultNodeConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, defaults);
    }
}

use std::sync::Arc;

use crate::error::PubSubError;
use crate::form::{DataForm, FormField};
use crate::item::PublishedItem;
use crate::node::config::LeafConfig;
use crate::node::item_store::ItemStore;
use crate::node::{ConfigureOutcome, NodeHooks};
use crate::types::NodeType;

/// A node that receives published items.
#[derive(Debug, Default)]
pub struct LeafNode {
    pub(crate) config: LeafConfig,
    pub(crate) items: ItemStore,
}

impl LeafNode {
    pub fn new(config: LeafConfig) -> Self {
        Self {
            config,
            items: ItemStore::new(),
        }
    }

    pub fn config(&self) -> &LeafConfig {
        &self.config
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    /// Items are created on publish when the node persists them or
    /// delivers payloads.
    pub fn is_item_required(&self, deliver_payloads: bool) -> bool {
        self.config.persist_items || deliver_payloads
    }
}

impl NodeHooks for LeafNode {
    type Config = LeafConfig;

    fn node_type(&self) -> NodeType {
        NodeType::Leaf
    }

    fn config(&self) -> &LeafConfig {
        &self.config
    }

    fn set_config(&mut self, config: LeafConfig) {
        self.config = config;
    }

    fn configure_field(
        config: &mut LeafConfig,
        field: &FormField,
        _outcome: &mut ConfigureOutcome,
    ) -> Result<bool, PubSubError> {
        config.apply_field(field)
    }

    fn post_configure(&mut self) -> Vec<Arc<PublishedItem>> {
        self.items.truncate(self.config.effective_max_items())
    }

    fn deleting_node(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn write_form(&self, form: &mut DataForm) {
        self.config.write_form(form);
    }

    fn published_item(&self, id: &str) -> Option<Arc<PublishedItem>> {
        self.items.get(id).cloned()
    }

    fn published_items(&self, max: Option<usize>) -> Vec<Arc<PublishedItem>> {
        self.items.recent(max)
    }

    fn last_published_item(&self) -> Option<Arc<PublishedItem>> {
        self.items.last().cloned()
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use jid::Jid;

use crate::error::PubSubError;
use crate::form::{DataForm, FormField};
use crate::item::PublishedItem;
use crate::node::config::{fields, CollectionConfig};
use crate::node::{ConfigureOutcome, NodeHooks};
use crate::types::{AssociationPolicy, NodeType};

/// A node whose children are other nodes. Holds no items.
#[derive(Debug, Default)]
pub struct CollectionNode {
    pub(crate) config: CollectionConfig,
    children: BTreeSet<String>,
}

impl CollectionNode {
    pub fn new(config: CollectionConfig) -> Self {
        Self {
            config,
            children: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Ids of the direct children.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(String::as_str)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn has_child(&self, node_id: &str) -> bool {
        self.children.contains(node_id)
    }

    pub(crate) fn add_child(&mut self, node_id: &str) -> bool {
        self.children.insert(node_id.to_string())
    }

    pub(crate) fn remove_child(&mut self, node_id: &str) -> bool {
        self.children.remove(node_id)
    }

    /// Whether `user` may create or move a node under this collection.
    pub fn is_association_allowed(&self, user: &Jid, is_admin: bool) -> bool {
        match self.config.association_policy {
            AssociationPolicy::All => true,
            AssociationPolicy::Owners => is_admin,
            AssociationPolicy::Whitelist => {
                let bare = user.to_bare();
                self.config.association_trusted.contains(&bare)
            }
        }
    }

    pub fn is_max_leaf_nodes_reached(&self) -> bool {
        self.config.max_leaf_nodes >= 0
            && self.children.len() >= self.config.max_leaf_nodes as usize
    }
}

impl NodeHooks for CollectionNode {
    type Config = CollectionConfig;

    fn node_type(&self) -> NodeType {
        NodeType::Collection
    }

    fn config(&self) -> &CollectionConfig {
        &self.config
    }

    fn set_config(&mut self, config: CollectionConfig) {
        self.config = config;
    }

    fn configure_field(
        config: &mut CollectionConfig,
        field: &FormField,
        outcome: &mut ConfigureOutcome,
    ) -> Result<bool, PubSubError> {
        if field.var == fields::CHILDREN {
            let children = field
                .values
                .iter()
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            outcome.children = Some(children);
            return Ok(true);
        }
        config.apply_field(field)
    }

    fn post_configure(&mut self) -> Vec<Arc<PublishedItem>> {
        Vec::new()
    }

    fn deleting_node(&mut self) -> Vec<String> {
        std::mem::take(&mut self.children).into_iter().collect()
    }

    fn write_form(&self, form: &mut DataForm) {
        self.config.write_form(form);
        form.add_field(fields::CHILDREN, self.children.iter().cloned());
    }
}

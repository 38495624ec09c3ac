//! Node lifecycle: create, configure, delete, purge and configuration reads.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::cluster::ClusterTask;
use crate::engine::{ConfigureNode, CreateNode, DeleteNode, GetDefaultConfiguration};
use crate::engine::{GetNodeConfiguration, PubSubEngine, PurgeNode};
use crate::error::PubSubError;
use crate::form::{DataForm, FormType};
use crate::item::{generate_id, ITEM_ID_LENGTH};
use crate::node::config::fields;
use crate::node::{ConfigureOutcome, Node, ROOT_NODE_ID};
use crate::persistence::log_failure;
use crate::types::NodeType;

impl PubSubEngine {
    /// Create a leaf or collection node. Returns the node id, generated for
    /// instant nodes.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn create_node(&self, req: CreateNode) -> Result<String, PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        if !service.can_create_node(&req.from) {
            return Err(PubSubError::forbidden("node creation is restricted"));
        }
        let node_id = match req.node_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => loop {
                let id = generate_id(ITEM_ID_LENGTH);
                if !service.contains_node(&id) {
                    break id;
                }
            },
        };
        let form = req.form.as_ref().filter(|f| f.form_type == FormType::Submit);

        let node_type = match form.and_then(|f| f.value(fields::NODE_TYPE)) {
            Some(value) => NodeType::from_str(value.trim())
                .ok_or_else(|| PubSubError::bad_request(format!("unknown node type: {value}")))?,
            None => NodeType::Leaf,
        };
        let parent = match form.and_then(|f| f.field(fields::COLLECTION)) {
            Some(field) => {
                let parent_id = field.first().unwrap_or(ROOT_NODE_ID);
                service
                    .node(parent_id)
                    .ok_or_else(|| PubSubError::NodeNotFound(parent_id.to_string()))?
            }
            None => self.node_or_root(None)?,
        };
        if !parent.is_collection() {
            return Err(PubSubError::not_acceptable(format!(
                "parent node {} is not a collection",
                parent.id()
            )));
        }
        if service.contains_node(&node_id) {
            return Err(PubSubError::Conflict(node_id));
        }
        {
            let state = parent.read().await;
            state.ensure_live()?;
            if let Some(collection) = state.kind().as_collection() {
                let is_admin = state.core().is_admin(service, &req.from);
                if !collection.is_association_allowed(&req.from, is_admin) {
                    return Err(PubSubError::forbidden(
                        "association with the parent collection is not allowed",
                    ));
                }
                if node_type == NodeType::Leaf && collection.is_max_leaf_nodes_reached() {
                    return Err(PubSubError::MaxNodesExceeded(parent.id().to_string()));
                }
            }
        }
        if node_type == NodeType::Collection {
            if let Some(children) = form.and_then(|f| f.field(fields::CHILDREN)) {
                self.validate_children(&node_id, parent.id(), &children.values)
                    .await?;
            }
        }

        let defaults = service.default_configuration(node_type);
        let node = Node::new(
            node_id.clone(),
            service.service_id(),
            Some(parent.id().to_string()),
            req.from.clone(),
            &defaults,
        );
        let outcome = {
            let mut state = node.write().await;
            if let Some(form) = form {
                state.validate_form(form)?;
            }
            state.add_owner(service, &req.from.to_bare()).await;
            let outcome = match form {
                Some(form) => state.configure(service, form).await?,
                None => ConfigureOutcome::default(),
            };
            if !service.register(Arc::clone(&node)) {
                return Err(PubSubError::Conflict(node_id));
            }
            state.save(service).await;
            outcome
        };
        self.attach_child(&parent, &node_id).await;
        if let Some(children) = outcome.children {
            for child in children.iter().filter_map(|id| service.node(id)) {
                self.move_node(&child, &node).await;
            }
        }
        info!(
            node = %node_id,
            node_type = %node_type,
            parent = %parent.id(),
            creator = %req.from,
            "Node created"
        );
        Ok(node_id)
    }

    /// Apply a configuration form. Moves the node when `pubsub#collection`
    /// changes and re-links children listed in `pubsub#children`.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn configure_node(&self, req: ConfigureNode) -> Result<(), PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        self.require_admin(&node, &req.from).await?;
        let form = &req.form;
        if form.form_type != FormType::Submit {
            return Ok(());
        }

        let new_parent = match form.field(fields::COLLECTION) {
            Some(field) => {
                let target = field.first().map(str::trim).unwrap_or(ROOT_NODE_ID);
                if node.is_root() {
                    if !target.is_empty() {
                        return Err(PubSubError::not_acceptable("the root node has no parent"));
                    }
                    None
                } else {
                    Some(self.resolve_new_parent(&node, target).await?)
                }
            }
            None => None,
        };
        let children = match form.field(fields::CHILDREN) {
            Some(field) if node.is_collection() => {
                let parent_id = match &new_parent {
                    Some(parent) => Some(parent.id().to_string()),
                    None => node.read().await.core().parent().map(str::to_string),
                };
                match parent_id {
                    Some(parent_id) => {
                        self.validate_children(node.id(), &parent_id, &field.values)
                            .await?
                    }
                    None => self.validate_root_children(&field.values)?,
                }
                true
            }
            _ => false,
        };

        let outcome = {
            let mut state = node.write().await;
            state.ensure_live()?;
            state.configure(service, form).await?
        };

        if let Some(parent) = new_parent {
            self.move_node(&node, &parent).await;
        }
        if let (true, Some(listed)) = (children, outcome.children) {
            self.relink_children(&node, &listed).await;
        }
        info!(node = %node.id(), "Node configuration updated");
        Ok(())
    }

    /// Delete a node. Its children move to the deleted node's parent.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn delete_node(&self, req: DeleteNode) -> Result<(), PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        let (parent_id, orphans) = {
            let mut state = node.write().await;
            state.ensure_live()?;
            if !state.core().is_admin(service, &req.from) {
                return Err(PubSubError::forbidden("requester is not a node owner"));
            }
            if node.is_root() {
                return Err(PubSubError::not_allowed("the root collection cannot be deleted"));
            }
            let parent_id = state.core().parent().map(str::to_string);
            (parent_id, state.tear_down(service).await)
        };

        service.unregister(node.id());
        log_failure(
            service.persistence().remove_node(node.id()).await,
            "remove_node",
            node.id(),
        );
        service.send_cluster_task(ClusterTask::RemoveNode {
            service_id: service.service_id().to_string(),
            node_id: node.id().to_string(),
        });

        let parent = parent_id.and_then(|id| service.node(&id));
        if let Some(parent) = &parent {
            self.detach_child(parent, node.id()).await;
        }
        if let Some(new_parent) = parent.or_else(|| service.root_node()) {
            for child in orphans.iter().filter_map(|id| service.node(id)) {
                self.move_node(&child, &new_parent).await;
            }
        }
        info!(node = %node.id(), reparented = orphans.len(), "Node deleted");
        Ok(())
    }

    /// Remove every item of a persistent leaf except the most recent one.
    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn purge_node(&self, req: PurgeNode) -> Result<usize, PubSubError> {
        self.ensure_available()?;
        let service = &*self.service;
        let node = self.require_node(req.node_id.as_deref())?;
        let mut state = node.write().await;
        state.ensure_live()?;
        if !state.core().is_admin(service, &req.from) {
            return Err(PubSubError::forbidden("requester is not a node owner"));
        }
        let persistent = match state.kind().as_leaf() {
            Some(leaf) => leaf.config().persist_items,
            None => return Err(PubSubError::unsupported("purge-nodes")),
        };
        if !persistent {
            return Err(PubSubError::unsupported("persistent-items"));
        }
        let purged = state.purge(service).await;
        info!(node = %node.id(), purged, "Node purged");
        Ok(purged)
    }

    #[instrument(skip(self, req), fields(node = ?req.node_id, from = %req.from))]
    pub async fn get_node_configuration(
        &self,
        req: GetNodeConfiguration,
    ) -> Result<DataForm, PubSubError> {
        self.ensure_available()?;
        let node = self.require_node(req.node_id.as_deref())?;
        let state = node.read().await;
        state.ensure_live()?;
        if !state.core().is_admin(&self.service, &req.from) {
            return Err(PubSubError::forbidden("requester is not a node owner"));
        }
        Ok(state.configuration_form())
    }

    /// Defaults applied to new nodes of a type.
    pub fn get_default_configuration(
        &self,
        req: GetDefaultConfiguration,
    ) -> Result<DataForm, PubSubError> {
        self.ensure_available()?;
        Ok(self.service.default_configuration(req.node_type).to_form())
    }

    /// New parent named by a `pubsub#collection` value. `""` is the root.
    async fn resolve_new_parent(&self, node: &Node, target: &str) -> Result<Arc<Node>, PubSubError> {
        let parent = self
            .service
            .node(target)
            .ok_or_else(|| PubSubError::NodeNotFound(target.to_string()))?;
        if !parent.is_collection() {
            return Err(PubSubError::not_acceptable(format!(
                "{target} is not a collection"
            )));
        }
        if self.is_in_lineage(target, node.id()).await {
            return Err(PubSubError::not_acceptable(
                "a node cannot be moved below itself",
            ));
        }
        Ok(parent)
    }

    /// Children listed for `node_id`, a collection placed under `parent_id`:
    /// each must exist and must not be the node or one of its ancestors.
    async fn validate_children(
        &self,
        node_id: &str,
        parent_id: &str,
        children: &[String],
    ) -> Result<(), PubSubError> {
        for child in children.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            if !self.service.contains_node(child) {
                return Err(PubSubError::not_acceptable(format!("unknown child node {child}")));
            }
            if child == node_id || self.is_in_lineage(parent_id, child).await {
                return Err(PubSubError::not_acceptable(format!(
                    "{child} cannot be a child of {node_id}"
                )));
            }
        }
        Ok(())
    }

    fn validate_root_children(&self, children: &[String]) -> Result<(), PubSubError> {
        for child in children.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            if !self.service.contains_node(child) {
                return Err(PubSubError::not_acceptable(format!("unknown child node {child}")));
            }
        }
        Ok(())
    }

    /// Make `listed` the children of `collection`. Children no longer
    /// listed move to the root.
    async fn relink_children(&self, collection: &Arc<Node>, listed: &[String]) {
        let service = &*self.service;
        for child in listed.iter().filter_map(|id| service.node(id)) {
            self.move_node(&child, collection).await;
        }
        if collection.is_root() {
            return;
        }
        let unlisted: Vec<String> = match collection.read().await.kind().as_collection() {
            Some(children) => children
                .children()
                .filter(|id| !listed.iter().any(|l| l == id))
                .map(str::to_string)
                .collect(),
            None => return,
        };
        let Some(root) = service.root_node() else {
            return;
        };
        for child in unlisted.iter().filter_map(|id| service.node(id)) {
            self.move_node(&child, &root).await;
        }
    }
}

//! Tasks mirrored between cluster members.
//!
//! Each task describes a state change already applied by the member that
//! emits it. Receiving members apply it to memory only: the emitting member
//! owns persistence and notification.

use jid::BareJid;
use serde::{Deserialize, Serialize};

use crate::node::NodeSubscription;
use crate::types::Affiliation;

/// State change sent to the other members of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ClusterTask {
    AffiliationChanged {
        service_id: String,
        node_id: String,
        jid: BareJid,
        affiliation: Affiliation,
    },
    NewSubscription {
        service_id: String,
        node_id: String,
        subscription: NodeSubscription,
    },
    ModifySubscription {
        service_id: String,
        node_id: String,
        subscription: NodeSubscription,
    },
    CancelSubscription {
        service_id: String,
        node_id: String,
        subscription_id: String,
    },
    RemoveNode {
        service_id: String,
        node_id: String,
    },
    /// Flush the write-behind queue of every member.
    FlushPendingItems { service_id: String },
}

impl ClusterTask {
    /// Task name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClusterTask::AffiliationChanged { .. } => "affiliation_changed",
            ClusterTask::NewSubscription { .. } => "new_subscription",
            ClusterTask::ModifySubscription { .. } => "modify_subscription",
            ClusterTask::CancelSubscription { .. } => "cancel_subscription",
            ClusterTask::RemoveNode { .. } => "remove_node",
            ClusterTask::FlushPendingItems { .. } => "flush_pending_items",
        }
    }

    pub fn service_id(&self) -> &str {
        match self {
            ClusterTask::AffiliationChanged { service_id, .. }
            | ClusterTask::NewSubscription { service_id, .. }
            | ClusterTask::ModifySubscription { service_id, .. }
            | ClusterTask::CancelSubscription { service_id, .. }
            | ClusterTask::RemoveNode { service_id, .. }
            | ClusterTask::FlushPendingItems { service_id } => service_id,
        }
    }

    /// Node the task refers to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ClusterTask::AffiliationChanged { node_id, .. }
            | ClusterTask::NewSubscription { node_id, .. }
            | ClusterTask::ModifySubscription { node_id, .. }
            | ClusterTask::CancelSubscription { node_id, .. }
            | ClusterTask::RemoveNode { node_id, .. } => Some(node_id),
            ClusterTask::FlushPendingItems { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_serializes_with_tag() {
        let task = ClusterTask::AffiliationChanged {
            service_id: "pubsub".into(),
            node_id: "news".into(),
            jid: "alice@example.com".parse().unwrap(),
            affiliation: Affiliation::Publisher,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "affiliation_changed");
        assert_eq!(json["affiliation"], "publisher");

        let back: ClusterTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.node_id(), Some("news"));
    }

    #[test]
    fn test_flush_task_has_no_node() {
        let task = ClusterTask::FlushPendingItems {
            service_id: "pubsub".into(),
        };
        assert_eq!(task.name(), "flush_pending_items");
        assert_eq!(task.service_id(), "pubsub");
        assert!(task.node_id().is_none());
    }
}

//! # waddle-pubsub
//!
//! XEP-0060 publish-subscribe engine for Waddle Social.
//!
//! The engine keeps a tree of nodes in memory: collection nodes group other
//! nodes, leaf nodes hold published items. Entities subscribe to nodes and
//! receive event notifications when items are published or retracted, when a
//! node is configured, purged or deleted, and when children are added to or
//! removed from a collection.
//!
//! ## Architecture
//!
//! - **Service**: [`PubSubService`] owns the node registry, the default
//!   configurations, the presence cache and the background flush and purge
//!   tasks.
//! - **Engine**: [`PubSubEngine`] validates typed requests and applies them
//!   under per-node locks.
//! - **Ports**: persistence, delivery, presence, roster and cluster
//!   transport are traits supplied by the host server. In-process
//!   implementations cover non-durable deployments and tests.
//!
//! Stanza parsing and rendering are left to the protocol layer.

pub mod access;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod form;
pub mod item;
pub mod metrics;
pub mod node;
pub mod persistence;
pub mod ports;
pub mod presence;
pub mod service;
pub mod types;

mod error;

pub use access::{AccessModel, PublisherModel};
pub use cluster::ClusterTask;
pub use config::{ConfigError, ServiceConfig};
pub use engine::{
    AffiliationInfo, PubSubEngine, PubSubRequest, PubSubResponse, SubscriptionInfo,
};
pub use error::{ErrorCondition, ErrorType, PersistenceError, PubSubError, ServiceError};
pub use form::{DataForm, FormField, FormType};
pub use item::{NewItem, PublishedItem};
pub use node::{Node, NodeState, ROOT_NODE_ID};
pub use persistence::InMemoryPersistence;
pub use ports::{
    BroadcastPort, ChannelBroadcaster, ClusterPort, Delivery, ItemView, ItemsEvent, Notification,
    PersistencePort, PresencePort, RosterPort,
};
pub use service::{PubSubService, ServicePorts};
pub use types::{Affiliation, NodeType, SubscriptionState, SubscriptionType};

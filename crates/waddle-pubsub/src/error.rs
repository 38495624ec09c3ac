//! Error types for the pubsub engine.
//!
//! Every rejected operation maps to exactly one [`PubSubError`] variant so the
//! protocol layer can render the matching XEP-0060 error without inspecting
//! message text. [`PubSubError::condition`] gives the RFC 6120 condition and
//! type, [`PubSubError::pubsub_condition`] the optional
//! `http://jabber.org/protocol/pubsub#errors` child.

use thiserror::Error;

/// Errors reported by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    /// The request did not name a node where one is mandatory.
    #[error("Node ID required")]
    NodeIdRequired,

    /// Target node does not exist.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Form or affiliation change rejected (e.g. would remove every owner).
    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    /// Requester lacks the required affiliation or admin rights.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation is not allowed in the current node or service configuration.
    #[error("Not allowed: {detail}")]
    NotAllowed {
        /// Human-readable reason.
        detail: String,
        /// Optional pubsub-specific condition (e.g. `closed-node`).
        pubsub_condition: Option<&'static str>,
    },

    /// Access model denied the request.
    #[error("Not authorized: {detail}")]
    NotAuthorized {
        /// Human-readable reason.
        detail: String,
        /// Optional pubsub-specific condition (e.g. `presence-subscription-required`).
        pubsub_condition: Option<&'static str>,
    },

    /// The node requires items but the request carried none.
    #[error("Item required")]
    ItemRequired,

    /// The node does not accept items but the request carried some.
    #[error("Item forbidden")]
    ItemForbidden,

    /// The node delivers payloads but an item had none.
    #[error("Payload required")]
    PayloadRequired,

    /// An item carried more than one payload element.
    #[error("Invalid payload")]
    InvalidPayload,

    /// Payload exceeded the node's `max_payload_size`.
    #[error("Payload too big: {size} bytes (limit {limit})")]
    PayloadTooBig {
        /// Serialized payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Duplicate node id, or duplicate same-type collection subscription.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not supported by the node type or configuration.
    #[error("Feature not implemented: {feature}")]
    FeatureNotImplemented {
        /// XEP-0060 feature name (e.g. `publish`, `purge-nodes`).
        feature: &'static str,
    },

    /// Referenced item does not exist.
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Referenced subscription does not exist.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Supplied subscription id does not match any subscription.
    #[error("Invalid subscription id: {0}")]
    InvalidSubscriptionId(String),

    /// Several subscriptions exist and the request did not pick one.
    #[error("Subscription ID required")]
    SubIdRequired,

    /// The request did not carry a subscriber JID.
    #[error("JID required")]
    JidRequired,

    /// Subscriber JID does not match the requester.
    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    /// Requester holds no (active) subscription to the node.
    #[error("Not subscribed")]
    NotSubscribed,

    /// Collection node reached `max_leaf_nodes`.
    #[error("Maximum number of nodes exceeded for collection {0}")]
    MaxNodesExceeded(String),

    /// Malformed request or form value.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Service is stopped (non-senior cluster member or shut down).
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl PubSubError {
    /// Create a new forbidden error.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a new not-acceptable error.
    pub fn not_acceptable(msg: impl Into<String>) -> Self {
        Self::NotAcceptable(msg.into())
    }

    /// Create a new bad-request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a new not-allowed error without a pubsub condition.
    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::NotAllowed {
            detail: msg.into(),
            pubsub_condition: None,
        }
    }

    /// Create a new feature-not-implemented error.
    pub fn unsupported(feature: &'static str) -> Self {
        Self::FeatureNotImplemented { feature }
    }

    /// RFC 6120 condition and error type for this error.
    pub fn condition(&self) -> (ErrorCondition, ErrorType) {
        use ErrorCondition as C;
        use ErrorType as T;
        match self {
            Self::NodeIdRequired => (C::BadRequest, T::Modify),
            Self::NodeNotFound(_) => (C::ItemNotFound, T::Cancel),
            Self::NotAcceptable(_) => (C::NotAcceptable, T::Modify),
            Self::Forbidden(_) => (C::Forbidden, T::Auth),
            Self::NotAllowed { .. } => (C::NotAllowed, T::Cancel),
            Self::NotAuthorized { .. } => (C::NotAuthorized, T::Auth),
            Self::ItemRequired => (C::BadRequest, T::Modify),
            Self::ItemForbidden => (C::BadRequest, T::Modify),
            Self::PayloadRequired => (C::BadRequest, T::Modify),
            Self::InvalidPayload => (C::BadRequest, T::Modify),
            Self::PayloadTooBig { .. } => (C::NotAcceptable, T::Modify),
            Self::Conflict(_) => (C::Conflict, T::Cancel),
            Self::FeatureNotImplemented { .. } => (C::FeatureNotImplemented, T::Cancel),
            Self::ItemNotFound(_) => (C::ItemNotFound, T::Cancel),
            Self::SubscriptionNotFound(_) => (C::ItemNotFound, T::Cancel),
            Self::InvalidSubscriptionId(_) => (C::NotAcceptable, T::Modify),
            Self::SubIdRequired => (C::BadRequest, T::Modify),
            Self::JidRequired => (C::BadRequest, T::Modify),
            Self::InvalidJid(_) => (C::BadRequest, T::Modify),
            Self::NotSubscribed => (C::UnexpectedRequest, T::Cancel),
            Self::MaxNodesExceeded(_) => (C::Conflict, T::Cancel),
            Self::BadRequest(_) => (C::BadRequest, T::Modify),
            Self::ServiceUnavailable => (C::ServiceUnavailable, T::Cancel),
        }
    }

    /// Application-specific condition from the `pubsub#errors` namespace.
    pub fn pubsub_condition(&self) -> Option<&'static str> {
        match self {
            Self::NodeIdRequired => Some("nodeid-required"),
            Self::NotAllowed {
                pubsub_condition, ..
            }
            | Self::NotAuthorized {
                pubsub_condition, ..
            } => *pubsub_condition,
            Self::ItemRequired => Some("item-required"),
            Self::ItemForbidden => Some("item-forbidden"),
            Self::PayloadRequired => Some("payload-required"),
            Self::InvalidPayload => Some("invalid-payload"),
            Self::PayloadTooBig { .. } => Some("payload-too-big"),
            Self::FeatureNotImplemented { .. } => Some("unsupported"),
            Self::InvalidSubscriptionId(_) => Some("invalid-subid"),
            Self::SubIdRequired => Some("subid-required"),
            Self::JidRequired => Some("jid-required"),
            Self::InvalidJid(_) => Some("invalid-jid"),
            Self::NotSubscribed => Some("not-subscribed"),
            Self::MaxNodesExceeded(_) => Some("max-nodes-exceeded"),
            _ => None,
        }
    }
}

/// Stanza error conditions used by the engine (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    ItemNotFound,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    ServiceUnavailable,
    UnexpectedRequest,
}

impl ErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl ErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised by a [`PersistencePort`](crate::ports::PersistencePort).
///
/// These never cross the engine boundary: the write path logs them and moves
/// on, because the in-memory model is authoritative.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Backing store rejected or failed the operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored data could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Referenced record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),
}

impl PersistenceError {
    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Errors raised while building or starting a
/// [`PubSubService`](crate::PubSubService).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Stored state could not be loaded
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

//! Published items.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use chrono::{DateTime, Utc};
use jid::Jid;
use minidom::Element;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::node::Node;

/// Length of server-generated item ids.
pub const ITEM_ID_LENGTH: usize = 15;

/// Length of subscription ids.
pub const SUBSCRIPTION_ID_LENGTH: usize = 40;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a random alphanumeric identifier.
pub fn generate_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// An item submitted for publication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewItem {
    /// Requested item id; a random id is generated when absent.
    pub id: Option<String>,
    /// Payload elements. At most one is accepted.
    pub payload: Vec<Element>,
}

impl NewItem {
    pub fn new(id: Option<String>, payload: Option<Element>) -> Self {
        Self {
            id,
            payload: payload.into_iter().collect(),
        }
    }
}

/// Composite key of a published item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub node_id: String,
    pub item_id: String,
}

impl ItemKey {
    pub fn new(node_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.item_id)
    }
}

/// Item payload, kept as an element or as serialized XML and converted on
/// first use in the other direction.
#[derive(Clone)]
pub struct Payload {
    element: OnceLock<Option<Element>>,
    xml: OnceLock<String>,
}

impl Payload {
    /// Wrap a parsed payload element.
    pub fn from_element(element: Element) -> Self {
        let payload = Self {
            element: OnceLock::new(),
            xml: OnceLock::new(),
        };
        let _ = payload.element.set(Some(element));
        payload
    }

    /// Wrap serialized payload XML as loaded from storage.
    pub fn from_xml(xml: impl Into<String>) -> Self {
        let payload = Self {
            element: OnceLock::new(),
            xml: OnceLock::new(),
        };
        let _ = payload.xml.set(xml.into());
        payload
    }

    /// Parsed payload element; `None` if the stored XML does not parse.
    pub fn element(&self) -> Option<&Element> {
        self.element
            .get_or_init(|| {
                self.xml.get().and_then(|xml| match xml.parse::<Element>() {
                    Ok(element) => Some(element),
                    Err(e) => {
                        tracing::warn!(error = %e, "Stored payload is not well-formed XML");
                        None
                    }
                })
            })
            .as_ref()
    }

    /// Serialized payload.
    pub fn as_xml(&self) -> &str {
        self.xml.get_or_init(|| {
            self.element
                .get()
                .and_then(Option::as_ref)
                .map(String::from)
                .unwrap_or_default()
        })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload").field(&self.as_xml()).finish()
    }
}

/// An item published to a leaf node.
///
/// Holds a non-owning reference to its node, set when the item is created.
#[derive(Debug)]
pub struct PublishedItem {
    node: Weak<Node>,
    node_id: String,
    id: String,
    publisher: Jid,
    created_at: DateTime<Utc>,
    payload: Option<Payload>,
}

impl PublishedItem {
    pub(crate) fn new(
        node: Weak<Node>,
        node_id: impl Into<String>,
        id: impl Into<String>,
        publisher: Jid,
        created_at: DateTime<Utc>,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            node,
            node_id: node_id.into(),
            id: id.into(),
            publisher,
            created_at,
            payload,
        }
    }

    /// Rebuild an item from its stored form.
    pub(crate) fn from_stored(node: Weak<Node>, stored: StoredItem) -> Self {
        Self {
            node,
            node_id: stored.node_id,
            id: stored.item_id,
            publisher: stored.publisher,
            created_at: stored.created_at,
            payload: stored.payload_xml.map(Payload::from_xml),
        }
    }

    /// The node this item was published to, if it still exists.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.node_id.clone(), self.id.clone())
    }

    pub fn publisher(&self) -> &Jid {
        &self.publisher
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Parsed payload element, if any.
    pub fn payload_element(&self) -> Option<&Element> {
        self.payload.as_ref().and_then(Payload::element)
    }

    /// Serialized payload, if any.
    pub fn payload_xml(&self) -> Option<&str> {
        self.payload.as_ref().map(Payload::as_xml)
    }

    /// Whether the serialized payload contains `keyword`.
    pub fn contains_keyword(&self, keyword: &str) -> bool {
        self.payload_xml()
            .map(|xml| xml.contains(keyword))
            .unwrap_or(false)
    }

    /// Whether `user` may retract this item. Node admins may always retract.
    pub fn can_delete(&self, user: &Jid, node_admin: bool) -> bool {
        node_admin || &self.publisher == user || self.publisher.to_bare() == user.to_bare()
    }

    /// Record handed to the persistence port.
    pub fn to_stored(&self) -> StoredItem {
        StoredItem {
            node_id: self.node_id.clone(),
            item_id: self.id.clone(),
            publisher: self.publisher.clone(),
            created_at: self.created_at,
            payload_xml: self.payload_xml().map(str::to_string),
        }
    }
}

/// Persistent form of a published item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub node_id: String,
    pub item_id: String,
    pub publisher: Jid,
    pub created_at: DateTime<Utc>,
    pub payload_xml: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_with_payload(xml: &str) -> PublishedItem {
        PublishedItem::new(
            Weak::new(),
            "news",
            "item-1",
            "alice@example.com/phone".parse().unwrap(),
            Utc::now(),
            Some(Payload::from_xml(xml)),
        )
    }

    #[test]
    fn test_generate_id_length_and_charset() {
        let id = generate_id(ITEM_ID_LENGTH);
        assert_eq!(id.len(), 15);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(generate_id(SUBSCRIPTION_ID_LENGTH).len(), 40);
    }

    #[test]
    fn test_payload_lazy_parse() {
        let payload = Payload::from_xml("<entry xmlns='urn:test'>hello</entry>");
        let element = payload.element().expect("payload should parse");
        assert_eq!(element.name(), "entry");
        assert_eq!(element.text(), "hello");
    }

    #[test]
    fn test_payload_lazy_serialize() {
        let element = Element::builder("geoloc", "http://jabber.org/protocol/geoloc").build();
        let payload = Payload::from_element(element);
        assert!(payload.as_xml().contains("geoloc"));
    }

    #[test]
    fn test_keyword_match() {
        let item = item_with_payload("<entry xmlns='urn:test'>rust release</entry>");
        assert!(item.contains_keyword("release"));
        assert!(!item.contains_keyword("golang"));
    }

    #[test]
    fn test_can_delete() {
        let item = item_with_payload("<entry xmlns='urn:test'/>");
        let same_bare: Jid = "alice@example.com/laptop".parse().unwrap();
        let other: Jid = "bob@example.com".parse().unwrap();
        assert!(item.can_delete(&same_bare, false));
        assert!(!item.can_delete(&other, false));
        assert!(item.can_delete(&other, true));
    }

    #[test]
    fn test_stored_roundtrip_keeps_key() {
        let item = item_with_payload("<entry xmlns='urn:test'/>");
        let stored = item.to_stored();
        let restored = PublishedItem::from_stored(Weak::new(), stored);
        assert_eq!(restored.key(), ItemKey::new("news", "item-1"));
        assert!(restored.node().is_none());
    }
}

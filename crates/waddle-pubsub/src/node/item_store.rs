//! In-memory item retention for a leaf node.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::item::PublishedItem;

/// Published items in publication order, plus an index by item id.
///
/// The front of the queue is the oldest item and the first to be evicted.
#[derive(Debug, Default)]
pub struct ItemStore {
    order: VecDeque<Arc<PublishedItem>>,
    index: HashMap<String, Arc<PublishedItem>>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<PublishedItem>> {
        self.index.get(id)
    }

    /// Most recently published item.
    pub fn last(&self) -> Option<&Arc<PublishedItem>> {
        self.order.back()
    }

    /// Items oldest first. With `max`, only the `max` most recent.
    pub fn recent(&self, max: Option<usize>) -> Vec<Arc<PublishedItem>> {
        let skip = match max {
            Some(max) => self.order.len().saturating_sub(max),
            None => 0,
        };
        self.order.iter().skip(skip).cloned().collect()
    }

    /// Append an item, replacing any item with the same id, then evict the
    /// oldest items beyond `max`. Returns every item removed.
    pub fn insert(
        &mut self,
        item: Arc<PublishedItem>,
        max: Option<usize>,
    ) -> Vec<Arc<PublishedItem>> {
        let mut removed = Vec::new();
        if let Some(previous) = self.remove(item.id()) {
            removed.push(previous);
        }
        self.index.insert(item.id().to_string(), item.clone());
        self.order.push_back(item);
        removed.extend(self.truncate(max));
        removed
    }

    /// Remove an item by id.
    pub fn remove(&mut self, id: &str) -> Option<Arc<PublishedItem>> {
        let item = self.index.remove(id)?;
        if let Some(pos) = self.order.iter().position(|i| i.id() == id) {
            self.order.remove(pos);
        }
        Some(item)
    }

    /// Evict the oldest items until at most `max` remain.
    pub fn truncate(&mut self, max: Option<usize>) -> Vec<Arc<PublishedItem>> {
        let Some(max) = max else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        while self.order.len() > max {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(oldest.id());
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// Remove every item except the most recent.
    pub fn purge_keep_last(&mut self) -> Vec<Arc<PublishedItem>> {
        self.truncate(Some(1))
    }
}

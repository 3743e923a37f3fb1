//! In-memory document store and change feed.
//!
//! Used by `statewatchd` fixtures and by tests. Every write notifies the
//! watchers of its collection, the way a real store's oplog tailer would.
//! All data is lost when dropped.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use statewatch_types::{Entity, KindRegistry};
use tokio::sync::mpsc;

use crate::backend::{Change, ChangeFeed, DocumentSource, WatchId};
use crate::error::{FeedError, FetchError, StoreError};

#[derive(Debug, Default)]
struct Inner {
    /// collection → document id → document.
    documents: HashMap<String, BTreeMap<String, Value>>,
    /// collection → registrations.
    watchers: HashMap<String, Vec<(WatchId, mpsc::UnboundedSender<Change>)>>,
    next_watch: u64,
    /// collection → injected fetch failure message.
    failures: HashMap<String, String>,
}

impl Inner {
    fn notify(&mut self, collection: &str, id: &str) {
        if let Some(watchers) = self.watchers.get_mut(collection) {
            watchers.retain(|(_, tx)| tx.send(Change::new(collection, id)).is_ok());
        }
    }
}

/// In-memory backing store implementing both [`DocumentSource`] and
/// [`ChangeFeed`].
///
/// Thread-safe via an internal mutex; writes and their notifications happen
/// under the same lock so watchers see them in write order.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document and notify watchers.
    pub fn put(&self, collection: &str, id: &str, doc: Value) {
        let mut inner = self.inner.lock();
        inner
            .documents
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        inner.notify(collection, id);
    }

    /// Insert or replace an entity snapshot as a document.
    pub fn put_entity<T: Entity>(
        &self,
        collection: &str,
        entity: &T,
    ) -> Result<(), serde_json::Error> {
        let doc = serde_json::to_value(entity)?;
        self.put(collection, entity.id(), doc);
        Ok(())
    }

    /// Insert or replace a document without notifying anyone.
    ///
    /// Simulates a write whose notification has not arrived yet.
    pub fn put_silently(&self, collection: &str, id: &str, doc: Value) {
        self.inner
            .lock()
            .documents
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    /// Delete a document and notify watchers. Returns whether it existed.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let existed = inner
            .documents
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        inner.notify(collection, id);
        existed
    }

    /// Deliver a notification without touching any document.
    pub fn touch(&self, collection: &str, id: &str) {
        self.inner.lock().notify(collection, id);
    }

    /// Make every fetch from `collection` fail with `message`.
    pub fn fail_fetches(&self, collection: &str, message: impl Into<String>) {
        self.inner
            .lock()
            .failures
            .insert(collection.to_string(), message.into());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Number of live registrations for a collection.
    pub fn watcher_count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .watchers
            .get(collection)
            .map_or(0, Vec::len)
    }

    /// Load `{collection: [document, ...]}` fixtures without notifying.
    ///
    /// Each document is decoded through `registry` to find its id, so a
    /// fixture that loads here also loads into the cache.
    pub fn load_fixture(
        &self,
        registry: &KindRegistry,
        fixture: &HashMap<String, Vec<Value>>,
    ) -> Result<usize, StoreError> {
        let mut loaded = 0;
        for (collection, docs) in fixture {
            let kind = registry.kind_for(collection)?;
            for (index, doc) in docs.iter().enumerate() {
                let info = kind.decode(doc.clone()).map_err(|e| StoreError::BadDocument {
                    collection: collection.clone(),
                    index,
                    message: e.to_string(),
                })?;
                self.put_silently(collection, info.entity_id(), doc.clone());
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

#[async_trait]
impl DocumentSource for MemoryBackend {
    async fn fetch_one(&self, collection: &str, id: &str) -> Result<Value, FetchError> {
        let inner = self.inner.lock();
        if let Some(message) = inner.failures.get(collection) {
            return Err(FetchError::backend(message.clone()));
        }
        inner
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or(FetchError::NotFound)
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>, FetchError> {
        let inner = self.inner.lock();
        if let Some(message) = inner.failures.get(collection) {
            return Err(FetchError::backend(message.clone()));
        }
        Ok(inner
            .documents
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}

impl ChangeFeed for MemoryBackend {
    fn watch(
        &self,
        collection: &str,
        tx: mpsc::UnboundedSender<Change>,
    ) -> Result<WatchId, FeedError> {
        let mut inner = self.inner.lock();
        inner.next_watch += 1;
        let watch = WatchId(inner.next_watch);
        inner
            .watchers
            .entry(collection.to_string())
            .or_default()
            .push((watch, tx));
        Ok(watch)
    }

    fn unwatch(&self, collection: &str, watch: WatchId) {
        let mut inner = self.inner.lock();
        if let Some(watchers) = inner.watchers.get_mut(collection) {
            watchers.retain(|(id, _)| *id != watch);
        }
    }
}

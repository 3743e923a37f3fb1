//! Boundary traits for the backing document store.
//!
//! Two collaborators sit outside the cache:
//!
//! - [`DocumentSource`] fetches the current document for an id, or all
//!   documents of a collection for the baseline load.
//! - [`ChangeFeed`] delivers unordered `(collection, id)` notifications
//!   whenever a document is inserted, updated, or deleted.
//!
//! Both are only ever driven from the aggregator task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statewatch_types::EntityId;
use tokio::sync::mpsc;

use crate::error::{FeedError, FetchError};

/// A raw change notification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Change {
    pub collection: String,
    pub id: String,
}

impl Change {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.collection.clone(), self.id.clone())
    }
}

/// Document fetch API of the backing store.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch one document. A missing document is `FetchError::NotFound`.
    async fn fetch_one(&self, collection: &str, id: &str)
        -> Result<serde_json::Value, FetchError>;

    /// Fetch every document currently in a collection.
    async fn fetch_all(&self, collection: &str) -> Result<Vec<serde_json::Value>, FetchError>;
}

/// Registration handle returned by [`ChangeFeed::watch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Change-notification transport of the backing store.
pub trait ChangeFeed: Send + Sync {
    /// Start delivering notifications for `collection` to `tx`.
    fn watch(
        &self,
        collection: &str,
        tx: mpsc::UnboundedSender<Change>,
    ) -> Result<WatchId, FeedError>;

    /// Stop a registration made by `watch`. Unknown ids are ignored.
    fn unwatch(&self, collection: &str, watch: WatchId);
}

//! Error types for the cache and the aggregator.
//!
//! Only [`WatchError`] ever reaches a Get caller. Fetch and feed failures stay
//! inside the aggregator; the fatal ones end its loop and are reported to
//! callers as `WatchError::Store`.

use statewatch_types::{EntityId, RegistryError};
use thiserror::Error;

/// Failure fetching a document from the backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The document does not exist (any more).
    #[error("document not found")]
    NotFound,

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

impl FetchError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Failure subscribing to the change-notification transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot watch collection {collection}: {message}")]
pub struct FeedError {
    pub collection: String,
    pub message: String,
}

/// Internal consistency failure: always a programming defect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("deleting entry {0} that has not been marked as removed")]
    DeleteLiveEntry(EntityId),

    #[error("index and revision sequence disagree about {0}")]
    IndexMismatch(EntityId),

    #[error("sequence holds {sequence} entries but index holds {index}")]
    SizeMismatch { sequence: usize, index: usize },

    #[error("entry {id} has revno {revno} beyond latest {latest}")]
    RevnoAhead { id: EntityId, revno: i64, latest: i64 },
}

/// Fatal cache errors. Any of these ends the aggregator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Notification for a collection with no registered kind.
    #[error(transparent)]
    UnknownKind(#[from] RegistryError),

    #[error("cannot get {id} from {collection}: {message}")]
    Fetch {
        collection: String,
        id: String,
        message: String,
    },

    #[error("cannot decode {id}: {message}")]
    Decode { id: EntityId, message: String },

    /// A bulk-loaded document could not be decoded, so it has no id yet.
    #[error("cannot decode document {index} of {collection}: {message}")]
    BadDocument {
        collection: String,
        index: usize,
        message: String,
    },

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("change feed closed")]
    FeedClosed,

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl StoreError {
    /// True for programming defects as opposed to environmental failures.
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

/// The errors a Get caller can observe.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// The aggregator was stopped (or stopped while the call was pending).
    #[error("state watcher was stopped")]
    Stopped,

    /// The aggregator terminated on a fatal cache error.
    #[error("state watcher failed: {0}")]
    Store(String),
}

impl From<&StoreError> for WatchError {
    fn from(err: &StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_messages() {
        let err = StoreError::Fetch {
            collection: "machines".into(),
            id: "0".into(),
            message: "connection reset".into(),
        };
        assert_eq!(err.to_string(), "cannot get 0 from machines: connection reset");
        assert!(!err.is_invariant());

        let err: StoreError =
            InvariantViolation::DeleteLiveEntry(EntityId::new("machines", "0")).into();
        assert!(err.is_invariant());
        assert_eq!(
            WatchError::from(&err).to_string(),
            "state watcher failed: invariant violation: deleting entry machines/0 that has not been marked as removed"
        );
    }

    #[test]
    fn test_unknown_kind_is_transparent() {
        let err: StoreError = RegistryError::UnknownKind("widgets".into()).into();
        assert_eq!(err.to_string(), "unknown entity collection: widgets");
    }
}

//! # statewatch-kernel
//!
//! Revision-ordered cache of backing-store entities, fed by change
//! notifications and served to any number of long-polling clients.
//!
//! The kernel:
//! - Subscribes to every registered collection through a [`ChangeFeed`]
//! - Loads a baseline through a [`DocumentSource`]
//! - Refreshes one entity per notification, stamping it with a global revno
//! - Answers `get(revno)` with every entity changed since that revno,
//!   blocking until there is something to report
//! - Keeps removals as tombstones until no client can still need them
//!
//! All cache state lives in one tokio task ([`Aggregator`]); callers only
//! hold a [`WatcherHandle`].

pub mod aggregator;
pub mod backend;
pub mod changes;
pub mod config;
pub mod constants;
pub mod error;
pub mod memory;
pub mod session;
pub mod store;

pub use aggregator::{Aggregator, WatcherHandle, WatcherState, WatcherStats};
pub use backend::{Change, ChangeFeed, DocumentSource, WatchId};
pub use changes::ChangeStream;
pub use config::{ConfigError, WatcherConfig};
pub use error::{FeedError, FetchError, InvariantViolation, StoreError, WatchError};
pub use memory::MemoryBackend;
pub use session::{ClientSession, PendingSessions, SessionId};
pub use store::{EntityStore, StoreStats};

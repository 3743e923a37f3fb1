//! Aggregator configuration defaults.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// Capacity of the raw `Changes()` broadcast. Slower subscribers lag and
/// skip ahead.
pub const DEFAULT_CHANGES_CAPACITY: usize = 1024;

/// How long a removed entry is kept after its removal before it may be
/// garbage-collected, even when no pending session still needs it.
/// Pollers that come back later than this can miss the removal.
pub const DEFAULT_TOMBSTONE_GRACE_MS: u64 = 60_000;

/// Period of the background garbage-collection tick.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 5_000;

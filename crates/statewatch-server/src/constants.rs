//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Revno `statewatchd` starts tailing from when `--from` is not given.
/// Zero replays the whole baseline.
pub const DEFAULT_FROM_REVNO: i64 = 0;

//! Support code for the `statewatchd` binary.
//!
//! - [`fixture`] seeds a `MemoryBackend` from a JSON file
//! - [`tail`] long-polls a watcher and writes each change set as a JSON line

pub mod constants;
pub mod fixture;
pub mod tail;

pub use fixture::{Fixture, FixtureError, read_fixture, seed_backend};
pub use tail::{TailError, tail};

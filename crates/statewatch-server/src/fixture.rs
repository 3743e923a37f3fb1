//! JSON fixtures for the in-memory backing store.
//!
//! A fixture maps collection names to arrays of documents:
//!
//! ```json
//! {
//!   "machines": [{ "id": "0", "instanceId": "i-0" }],
//!   "services": [{ "name": "wordpress", "exposed": true }]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use statewatch_kernel::{MemoryBackend, StoreError};
use statewatch_types::KindRegistry;
use thiserror::Error;

/// Collection name → documents.
pub type Fixture = HashMap<String, Vec<Value>>;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("cannot read fixture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fixture {path} is not a collection map: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Load(#[from] StoreError),
}

/// Read and parse a fixture file.
pub fn read_fixture(path: impl AsRef<Path>) -> Result<Fixture, FixtureError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| FixtureError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a fixture file into `backend`. Returns the number of documents.
///
/// Every document must decode as its collection's registered kind.
pub fn seed_backend(
    backend: &MemoryBackend,
    registry: &KindRegistry,
    path: impl AsRef<Path>,
) -> Result<usize, FixtureError> {
    let fixture = read_fixture(path)?;
    let loaded = backend.load_fixture(registry, &fixture)?;
    tracing::info!(documents = loaded, collections = fixture.len(), "fixture loaded");
    Ok(loaded)
}

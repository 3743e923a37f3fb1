//! Long-poll loop writing change sets as JSON lines.
//!
//! Each line is one `ChangeSet`:
//!
//! ```json
//! {"deltas":[["machine","change",{"id":"0","instanceId":"i-0"}]],"revno":1}
//! ```

use std::io::Write;

use statewatch_kernel::{WatchError, WatcherHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TailError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("cannot encode change set: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cannot write change set: {0}")]
    Io(#[from] std::io::Error),
}

/// Poll `handle` from `from`, writing each change set to `out`.
///
/// Runs until the watcher fails or, when `max_batches` is set, after that
/// many change sets. Returns the revno to resume from.
pub async fn tail<W: Write>(
    handle: &WatcherHandle,
    from: i64,
    out: &mut W,
    max_batches: Option<usize>,
) -> Result<i64, TailError> {
    let mut revno = from;
    let mut written = 0;
    while max_batches.is_none_or(|max| written < max) {
        let set = handle.get(revno).await?;
        serde_json::to_writer(&mut *out, &set)?;
        writeln!(out)?;
        out.flush()?;
        tracing::debug!(
            from = revno,
            revno = set.revno,
            deltas = set.deltas.len(),
            "change set written"
        );
        revno = set.revno;
        written += 1;
    }
    Ok(revno)
}

//! Raw change pass-through.
//!
//! Every notification the aggregator receives from the feed is re-broadcast,
//! before the cache processes it, to any number of [`ChangeStream`]s. Nothing
//! is buffered for late subscribers.

use tokio::sync::broadcast;

use crate::backend::Change;

/// Receiving end of the raw change pass-through.
///
/// A stream that falls more than the configured capacity behind skips the
/// notifications it missed and keeps going.
pub struct ChangeStream {
    rx: broadcast::Receiver<Change>,
}

impl ChangeStream {
    pub(crate) fn new(rx: broadcast::Receiver<Change>) -> Self {
        Self { rx }
    }

    /// Receive the next notification, waiting if necessary.
    ///
    /// Returns None once the aggregator has stopped.
    pub async fn recv(&mut self) -> Option<Change> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "change stream lagged behind");
                }
            }
        }
    }

    /// Receive the next notification without blocking.
    pub fn try_recv(&mut self) -> Option<Change> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "change stream lagged behind");
                }
                Err(_) => return None,
            }
        }
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("queued", &self.rx.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_until_closed() {
        let (tx, rx) = broadcast::channel(4);
        let mut stream = ChangeStream::new(rx);

        tx.send(Change::new("machines", "0")).unwrap();
        assert_eq!(stream.recv().await, Some(Change::new("machines", "0")));
        assert_eq!(stream.try_recv(), None);

        drop(tx);
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_lag_skips_ahead() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = ChangeStream::new(rx);
        for id in ["0", "1", "2", "3"] {
            tx.send(Change::new("machines", id)).unwrap();
        }

        assert_eq!(stream.try_recv(), Some(Change::new("machines", "2")));
        assert_eq!(stream.recv().await, Some(Change::new("machines", "3")));
    }
}

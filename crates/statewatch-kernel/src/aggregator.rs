//! The aggregator task and its handle.
//!
//! One task owns the [`EntityStore`] and every pending Get. Callers talk to
//! it through a cloneable [`WatcherHandle`]; each call is a command on an
//! mpsc channel answered over its own oneshot.
//!
//! ```text
//!   WatcherHandle (Clone)       mpsc        Aggregator (tokio task)
//!   ┌─────────────────────┐  ─────────▶  ┌─────────────────────────────┐
//!   │ .get(revno)         │              │ EntityStore                 │
//!   │ .changes()          │  ◀─────────  │ PendingSessions             │
//!   │ .stats()            │   oneshot    │ ChangeFeed registrations    │
//!   │ .stop() / .wait()   │              │                             │
//!   └─────────────────────┘              └──────────────▲──────────────┘
//!                                                       │ (collection, id)
//!                                                   ChangeFeed
//! ```
//!
//! Lifecycle is `Running → Stopping → Stopped`. Stopping begins on
//! [`WatcherHandle::stop`], when every handle is dropped, or on a fatal
//! [`StoreError`]. While stopping, pending Gets fail, feed registrations are
//! removed, and [`ChangeStream`]s end. Once stopped, Gets fail immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use statewatch_types::{ChangeSet, KindRegistry};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{Change, ChangeFeed, DocumentSource, WatchId};
use crate::changes::ChangeStream;
use crate::config::WatcherConfig;
use crate::error::{InvariantViolation, StoreError, WatchError};
use crate::session::{ClientSession, GetReply, PendingSessions, SessionId};
use crate::store::EntityStore;

/// Lifecycle of an aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Running,
    Stopping,
    Stopped,
}

/// Snapshot of aggregator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    pub latest_revno: i64,
    pub entries: usize,
    pub tombstones: usize,
    pub pending_sessions: usize,
}

#[derive(Clone, Debug)]
struct Status {
    state: WatcherState,
    /// The fatal error that ended the loop, if any.
    error: Option<StoreError>,
}

// ============================================================================
// Commands (internal)
// ============================================================================

enum Command {
    Get {
        session: SessionId,
        revno: i64,
        reply: GetReply,
    },
    Abandon {
        session: SessionId,
    },
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<Change>>,
    },
    Stats {
        reply: oneshot::Sender<WatcherStats>,
    },
}

// ============================================================================
// Aggregator
// ============================================================================

/// Single-task owner of the cache and the pending sessions.
pub struct Aggregator {
    store: EntityStore,
    pending: PendingSessions,
    feed: Arc<dyn ChangeFeed>,
    watches: Vec<(String, WatchId)>,
    changes_in: mpsc::UnboundedReceiver<Change>,
    changes_out: broadcast::Sender<Change>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    status: watch::Sender<Status>,
    config: WatcherConfig,
}

impl Aggregator {
    /// Subscribe to every registered collection, load the baseline, and
    /// spawn the aggregator task.
    ///
    /// Subscriptions are made before the load so nothing written during it
    /// is missed; notifications for documents the load already saw are
    /// absorbed as unchanged updates. Any failure here unwinds the
    /// subscriptions already made.
    pub async fn start(
        registry: KindRegistry,
        source: Arc<dyn DocumentSource>,
        feed: Arc<dyn ChangeFeed>,
        config: WatcherConfig,
    ) -> Result<WatcherHandle, StoreError> {
        let registry = Arc::new(registry);
        let (changes_tx, changes_in) = mpsc::unbounded_channel();

        let mut watches = Vec::new();
        for collection in registry.collections() {
            match feed.watch(collection, changes_tx.clone()) {
                Ok(watch) => watches.push((collection.to_string(), watch)),
                Err(e) => {
                    unwatch_all(feed.as_ref(), &mut watches);
                    return Err(e.into());
                }
            }
        }
        drop(changes_tx);

        let mut store = EntityStore::new(registry, source);
        if let Err(e) = store.load_all().await {
            unwatch_all(feed.as_ref(), &mut watches);
            return Err(e);
        }
        tracing::info!(
            entries = store.len(),
            revno = store.latest_revno(),
            collections = watches.len(),
            "state watcher started"
        );

        let (tx, commands) = mpsc::unbounded_channel();
        let (changes_out, _) = broadcast::channel(config.changes_capacity.max(1));
        let (status, status_rx) = watch::channel(Status {
            state: WatcherState::Running,
            error: None,
        });
        let cancel = CancellationToken::new();

        let aggregator = Self {
            store,
            pending: PendingSessions::new(),
            feed,
            watches,
            changes_in,
            changes_out,
            commands,
            cancel: cancel.clone(),
            status,
            config,
        };
        tokio::spawn(aggregator.run());

        Ok(WatcherHandle {
            tx,
            cancel,
            status: status_rx,
            next_session: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn run(mut self) {
        let period = self.config.gc_interval().max(Duration::from_millis(1));
        let mut gc_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        gc_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break Ok(()),

                change = self.changes_in.recv() => match change {
                    Some(change) => {
                        if let Err(e) = self.handle_change(change).await {
                            break Err(e);
                        }
                    }
                    None => break Err(StoreError::FeedClosed),
                },

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("all watcher handles dropped");
                        break Ok(());
                    }
                },

                _ = gc_tick.tick() => {
                    self.prune_abandoned();
                    if let Err(e) = self.collect_garbage() {
                        break Err(e.into());
                    }
                }
            }
        };

        self.shutdown(result);
    }

    async fn handle_change(&mut self, change: Change) -> Result<(), StoreError> {
        // No subscribers is fine.
        let _ = self.changes_out.send(change.clone());

        let id = change.entity_id();
        let Some(revno) = self.store.update(&id).await? else {
            tracing::trace!(entity = %id, "no-op change");
            return Ok(());
        };
        tracing::debug!(
            entity = %id,
            revno,
            removed = self.store.is_removed(&id),
            "cache updated"
        );

        self.prune_abandoned();
        let resolved = self.pending.resolve_ready(&self.store);
        if resolved > 0 {
            tracing::debug!(resolved, pending = self.pending.len(), revno, "pending gets resolved");
        }
        self.collect_garbage()?;
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Get {
                session,
                revno,
                reply,
            } => {
                let session = ClientSession::new(session, revno, reply);
                if self.store.has_changes_since(revno) {
                    let changes = self.store.changes_since(revno);
                    tracing::debug!(
                        session = %session.id,
                        baseline = revno,
                        deltas = changes.deltas.len(),
                        "get answered immediately"
                    );
                    session.resolve(Ok(changes));
                } else {
                    tracing::debug!(session = %session.id, baseline = revno, "get pending");
                    self.pending.insert(session);
                }
            }
            Command::Abandon { session } => {
                if self.pending.abandon(session) {
                    tracing::debug!(%session, "pending get abandoned");
                }
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.changes_out.subscribe());
            }
            Command::Stats { reply } => {
                let store = self.store.stats();
                let _ = reply.send(WatcherStats {
                    latest_revno: store.latest_revno,
                    entries: store.entries,
                    tombstones: store.tombstones,
                    pending_sessions: self.pending.len(),
                });
            }
        }
    }

    fn prune_abandoned(&mut self) {
        let pruned = self.pending.prune_abandoned();
        if pruned > 0 {
            tracing::warn!(pruned, "dropped pending gets whose callers went away");
        }
    }

    /// Delete tombstones no pending session can still need.
    fn collect_garbage(&mut self) -> Result<usize, InvariantViolation> {
        let low_water = self
            .pending
            .low_water()
            .unwrap_or_else(|| self.store.latest_revno());
        self.store
            .collect_garbage(low_water, self.config.tombstone_grace(), Instant::now())
    }

    fn shutdown(mut self, result: Result<(), StoreError>) {
        let error = result.err();
        self.status.send_replace(Status {
            state: WatcherState::Stopping,
            error: error.clone(),
        });
        match &error {
            None => tracing::info!(pending = self.pending.len(), "state watcher stopping"),
            Some(e) if e.is_invariant() => {
                tracing::error!(error = %e, "state watcher aborted on invariant violation")
            }
            Some(e) => tracing::error!(error = %e, "state watcher failed"),
        }
        self.cancel.cancel();

        let err = error.as_ref().map_or(WatchError::Stopped, WatchError::from);

        // Answer anything that raced with the stop.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Get { reply, .. } = command {
                let _ = reply.send(Err(err.clone()));
            }
        }
        self.pending.fail_all(&err);
        unwatch_all(self.feed.as_ref(), &mut self.watches);

        let Self {
            changes_out, status, ..
        } = self;
        drop(changes_out);
        status.send_replace(Status {
            state: WatcherState::Stopped,
            error,
        });
        tracing::info!("state watcher stopped");
    }
}

fn unwatch_all(feed: &dyn ChangeFeed, watches: &mut Vec<(String, WatchId)>) {
    for (collection, watch) in watches.drain(..) {
        feed.unwatch(&collection, watch);
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running aggregator.
///
/// The aggregator stops once every handle is dropped.
#[derive(Clone)]
pub struct WatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    status: watch::Receiver<Status>,
    next_session: Arc<AtomicU64>,
}

impl WatcherHandle {
    /// Wait until the cache holds changes past `revno`, then return them.
    ///
    /// Returns immediately when changes are already available. Dropping the
    /// returned future abandons the request.
    pub async fn get(&self, revno: i64) -> Result<ChangeSet, WatchError> {
        self.ensure_running()?;
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Get {
                session,
                revno,
                reply,
            })
            .map_err(|_| self.stopped_error())?;

        let guard = AbandonOnDrop {
            tx: &self.tx,
            session,
            armed: true,
        };
        let result = rx.await;
        guard.disarm();
        result.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// Subscribe to the raw change notifications the aggregator receives.
    pub async fn changes(&self) -> Result<ChangeStream, WatchError> {
        self.ensure_running()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe { reply })
            .map_err(|_| self.stopped_error())?;
        rx.await
            .map(ChangeStream::new)
            .map_err(|_| self.stopped_error())
    }

    pub async fn stats(&self) -> Result<WatcherStats, WatchError> {
        self.ensure_running()?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply })
            .map_err(|_| self.stopped_error())?;
        rx.await.map_err(|_| self.stopped_error())
    }

    /// Ask the aggregator to stop. Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> WatcherState {
        self.status.borrow().state
    }

    /// Wait for the aggregator to reach `Stopped`.
    ///
    /// Returns the fatal error that ended it, or `Ok` after a plain stop.
    pub async fn wait(&self) -> Result<(), StoreError> {
        let mut status = self.status.clone();
        let outcome = status
            .wait_for(|s| s.state == WatcherState::Stopped)
            .await
            .map(|s| s.error.clone());
        match outcome {
            Ok(Some(e)) => Err(e),
            Ok(None) => Ok(()),
            // The task went away without reporting; nothing more to learn.
            Err(_) => Ok(()),
        }
    }

    /// Refuse new requests once a stop has been asked for, even if the task
    /// has not seen the cancellation yet.
    fn ensure_running(&self) -> Result<(), WatchError> {
        if self.cancel.is_cancelled() || self.state() != WatcherState::Running {
            return Err(self.stopped_error());
        }
        Ok(())
    }

    fn stopped_error(&self) -> WatchError {
        self.status
            .borrow()
            .error
            .as_ref()
            .map_or(WatchError::Stopped, WatchError::from)
    }
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Tells the aggregator to forget a Get whose future was dropped.
struct AbandonOnDrop<'a> {
    tx: &'a mpsc::UnboundedSender<Command>,
    session: SessionId,
    armed: bool,
}

impl AbandonOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(Command::Abandon {
                session: self.session,
            });
        }
    }
}

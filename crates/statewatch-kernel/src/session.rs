//! Pending long-poll requests.
//!
//! A [`ClientSession`] is one blocked Get: the revno its caller has already
//! seen, plus the oneshot to answer on. Sessions only live inside the
//! aggregator task; callers hold nothing but the receiving half.

use std::collections::BTreeMap;

use statewatch_types::ChangeSet;
use tokio::sync::oneshot;

use crate::error::WatchError;
use crate::store::EntityStore;

/// Reply channel of one Get.
pub type GetReply = oneshot::Sender<Result<ChangeSet, WatchError>>;

/// Identifies a Get so its caller can abandon it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One Get waiting for the cache to move past its baseline.
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    /// Revno the caller has already seen.
    pub baseline: i64,
    reply: GetReply,
}

impl ClientSession {
    pub fn new(id: SessionId, baseline: i64, reply: GetReply) -> Self {
        Self {
            id,
            baseline,
            reply,
        }
    }

    /// The caller dropped its end of the reply channel.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Deliver the outcome. A caller that already left is not an error.
    pub fn resolve(self, result: Result<ChangeSet, WatchError>) {
        if self.reply.send(result).is_err() {
            tracing::trace!(session = %self.id, "caller went away before reply");
        }
    }
}

/// All sessions currently blocked, keyed by id.
#[derive(Debug, Default)]
pub struct PendingSessions {
    sessions: BTreeMap<SessionId, ClientSession>,
}

impl PendingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: ClientSession) {
        self.sessions.insert(session.id, session);
    }

    /// Drop a session without answering it. Returns whether it was pending.
    pub fn abandon(&mut self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Lowest baseline among pending sessions.
    ///
    /// Tombstones at or below this revno cannot be in any pending reply.
    pub fn low_water(&self) -> Option<i64> {
        self.sessions.values().map(|s| s.baseline).min()
    }

    /// Answer every session the store has moved past. Returns how many were
    /// answered.
    ///
    /// Sessions whose baseline is still current stay pending, so no reply is
    /// ever an empty change set.
    pub fn resolve_ready(&mut self, store: &EntityStore) -> usize {
        let ready: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| store.has_changes_since(s.baseline))
            .map(|s| s.id)
            .collect();

        for id in &ready {
            if let Some(session) = self.sessions.remove(id) {
                let changes = store.changes_since(session.baseline);
                tracing::trace!(
                    session = %id,
                    baseline = session.baseline,
                    deltas = changes.deltas.len(),
                    "resolving pending get"
                );
                session.resolve(Ok(changes));
            }
        }
        ready.len()
    }

    /// Forget sessions whose callers dropped the reply receiver.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_abandoned());
        before - self.sessions.len()
    }

    /// Answer every pending session with `err`.
    pub fn fail_all(&mut self, err: &WatchError) {
        for (_, session) in std::mem::take(&mut self.sessions) {
            session.resolve(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use statewatch_types::{EntityId, MachineInfo, default_registry};

    use super::*;
    use crate::memory::MemoryBackend;

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(default_registry()), Arc::new(MemoryBackend::new()))
    }

    fn add_machine(store: &mut EntityStore, id: &str) -> i64 {
        store.add(
            EntityId::new("machines", id),
            Arc::new(MachineInfo {
                id: id.into(),
                instance_id: String::new(),
            }),
        )
    }

    fn session(
        id: u64,
        baseline: i64,
    ) -> (ClientSession, oneshot::Receiver<Result<ChangeSet, WatchError>>) {
        let (tx, rx) = oneshot::channel();
        (ClientSession::new(SessionId(id), baseline, tx), rx)
    }

    #[test]
    fn test_resolve_ready_only_answers_sessions_behind() {
        let mut store = store();
        add_machine(&mut store, "0");

        let mut pending = PendingSessions::new();
        let (behind, mut behind_rx) = session(1, 0);
        let (current, mut current_rx) = session(2, 1);
        pending.insert(behind);
        pending.insert(current);

        assert_eq!(pending.resolve_ready(&store), 1);
        let set = behind_rx.try_recv().unwrap().unwrap();
        assert_eq!(set.revno, 1);
        assert_eq!(set.deltas.len(), 1);
        assert!(current_rx.try_recv().is_err());
        assert_eq!(pending.len(), 1);

        add_machine(&mut store, "1");
        assert_eq!(pending.resolve_ready(&store), 1);
        let set = current_rx.try_recv().unwrap().unwrap();
        assert_eq!(set.revno, 2);
        assert_eq!(set.deltas.len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_low_water_is_min_baseline() {
        let mut pending = PendingSessions::new();
        assert_eq!(pending.low_water(), None);

        let (a, _a_rx) = session(1, 7);
        let (b, _b_rx) = session(2, 3);
        pending.insert(a);
        pending.insert(b);
        assert_eq!(pending.low_water(), Some(3));

        assert!(pending.abandon(SessionId(2)));
        assert!(!pending.abandon(SessionId(2)));
        assert_eq!(pending.low_water(), Some(7));
    }

    #[test]
    fn test_prune_abandoned() {
        let mut pending = PendingSessions::new();
        let (kept, _kept_rx) = session(1, 0);
        let (gone, gone_rx) = session(2, 0);
        pending.insert(kept);
        pending.insert(gone);

        drop(gone_rx);
        assert_eq!(pending.prune_abandoned(), 1);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_fail_all() {
        let mut pending = PendingSessions::new();
        let (a, mut a_rx) = session(1, 0);
        pending.insert(a);

        pending.fail_all(&WatchError::Stopped);
        assert!(pending.is_empty());
        assert_eq!(a_rx.try_recv().unwrap(), Err(WatchError::Stopped));
    }
}

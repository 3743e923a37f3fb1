//! Revision-ordered entity cache.
//!
//! Every mutation takes the next value of one store-wide revno counter, shared
//! by all entity kinds. The sequence is keyed by revno, so an entry's position
//! always matches its revno rank and "what changed since R" is a range scan.
//!
//! ```text
//!   sequence (revno → id)              entries (id → entry)
//!   ┌──────┬──────────────┐            ┌──────────────┬───────────────────────┐
//!   │  3   │ machines/1   │ ◀────────▶ │ machines/1   │ revno 3, live         │
//!   │  5   │ units/wp/0   │ ◀────────▶ │ units/wp/0   │ revno 5, live         │
//!   │  6   │ machines/0   │ ◀────────▶ │ machines/0   │ revno 6, removed      │
//!   └──────┴──────────────┘            └──────────────┴───────────────────────┘
//! ```
//!
//! Removed entries stay as tombstones so late pollers still see the removal;
//! [`EntityStore::collect_garbage`] deletes them once nobody can need them.
//!
//! The store is owned by exactly one aggregator task and is not `Sync`-shared.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use statewatch_types::{ChangeSet, Delta, EntityId, KindRegistry, SharedInfo};

use crate::backend::DocumentSource;
use crate::error::{FetchError, InvariantViolation, StoreError};

/// One cached entity.
#[derive(Clone, Debug)]
struct EntityEntry {
    /// Store-local revno of the latest mutation of this entry. Independent of
    /// any revision the backing store keeps.
    revno: i64,
    removed: bool,
    /// When the entry was marked removed; drives the tombstone grace window.
    removed_at: Option<Instant>,
    info: SharedInfo,
}

/// Counters reported through `WatcherHandle::stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub latest_revno: i64,
    pub entries: usize,
    pub tombstones: usize,
}

/// The authoritative in-memory cache.
pub struct EntityStore {
    registry: Arc<KindRegistry>,
    source: Arc<dyn DocumentSource>,
    /// revno → id, ascending. One element per entry.
    sequence: BTreeMap<i64, EntityId>,
    entries: HashMap<EntityId, EntityEntry>,
    latest_revno: i64,
    tombstones: usize,
}

impl EntityStore {
    pub fn new(registry: Arc<KindRegistry>, source: Arc<dyn DocumentSource>) -> Self {
        Self {
            registry,
            source,
            sequence: BTreeMap::new(),
            entries: HashMap::new(),
            latest_revno: 0,
            tombstones: 0,
        }
    }

    pub fn registry(&self) -> &Arc<KindRegistry> {
        &self.registry
    }

    /// Revno of the most recent mutation; 0 for an empty, untouched store.
    pub fn latest_revno(&self) -> i64 {
        self.latest_revno
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether the entry exists and is a tombstone.
    pub fn is_removed(&self, id: &EntityId) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.removed)
    }

    /// Current revno of an entry.
    pub fn revno_of(&self, id: &EntityId) -> Option<i64> {
        self.entries.get(id).map(|entry| entry.revno)
    }

    /// Current snapshot of an entry, tombstones included.
    pub fn info(&self, id: &EntityId) -> Option<&SharedInfo> {
        self.entries.get(id).map(|entry| &entry.info)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            latest_revno: self.latest_revno,
            entries: self.entries.len(),
            tombstones: self.tombstones,
        }
    }

    /// Fetch every document of every registered collection and add it.
    ///
    /// Used once at startup; any error aborts startup.
    pub async fn load_all(&mut self) -> Result<usize, StoreError> {
        let registry = Arc::clone(&self.registry);
        let mut loaded = 0;
        for collection in registry.collections() {
            let kind = registry.kind_for(collection)?;
            let docs = self
                .source
                .fetch_all(collection)
                .await
                .map_err(|e| StoreError::Fetch {
                    collection: collection.to_string(),
                    id: "*".to_string(),
                    message: e.to_string(),
                })?;
            for (index, doc) in docs.into_iter().enumerate() {
                let info = kind.decode(doc).map_err(|e| StoreError::BadDocument {
                    collection: collection.to_string(),
                    index,
                    message: e.to_string(),
                })?;
                let id = EntityId::new(collection, info.entity_id());
                self.add(id, info);
                loaded += 1;
            }
            tracing::debug!(collection, loaded, "collection loaded");
        }
        Ok(loaded)
    }

    /// Insert `info` at the most recent position with the next revno.
    ///
    /// If `id` is already cached its entry is replaced (and revived if it was
    /// a tombstone), which keeps the one-entry-per-id invariant.
    pub fn add(&mut self, id: EntityId, info: SharedInfo) -> i64 {
        if self.entries.contains_key(&id) {
            return self.replace(&id, info);
        }
        self.latest_revno += 1;
        let revno = self.latest_revno;
        self.sequence.insert(revno, id.clone());
        self.entries.insert(
            id,
            EntityEntry {
                revno,
                removed: false,
                removed_at: None,
                info,
            },
        );
        revno
    }

    /// Refresh one entity from the backing store after a change notification.
    ///
    /// Returns the new revno when the cache changed, `None` for a no-op:
    /// removal of something never seen (or already removed), or a document
    /// identical to the cached snapshot.
    pub async fn update(&mut self, id: &EntityId) -> Result<Option<i64>, StoreError> {
        let registry = Arc::clone(&self.registry);
        let kind = registry.kind_for(&id.collection)?;

        let doc = match self.source.fetch_one(&id.collection, &id.id).await {
            Ok(doc) => doc,
            Err(FetchError::NotFound) => return Ok(self.mark_removed(id)),
            Err(FetchError::Backend(message)) => {
                return Err(StoreError::Fetch {
                    collection: id.collection.clone(),
                    id: id.id.clone(),
                    message,
                });
            }
        };

        let info = kind.decode(doc).map_err(|e| StoreError::Decode {
            id: id.clone(),
            message: e.to_string(),
        })?;
        if info.entity_id() != id.id {
            return Err(StoreError::Decode {
                id: id.clone(),
                message: format!("document carries id {:?}", info.entity_id()),
            });
        }

        match self.entries.get(id) {
            Some(entry) if !entry.removed && entry.info.same_as(info.as_ref()) => {
                tracing::trace!(entity = %id, revno = entry.revno, "unchanged; skipping");
                Ok(None)
            }
            Some(_) => Ok(Some(self.replace(id, info))),
            None => Ok(Some(self.add(id.clone(), info))),
        }
    }

    /// Physically remove a tombstone.
    ///
    /// Returns whether anything was deleted; an absent id is a no-op. Deleting
    /// a live entry is an invariant violation.
    pub fn delete(&mut self, id: &EntityId) -> Result<bool, InvariantViolation> {
        let Some(entry) = self.entries.get(id) else {
            return Ok(false);
        };
        if !entry.removed {
            return Err(InvariantViolation::DeleteLiveEntry(id.clone()));
        }
        let revno = entry.revno;
        if self.sequence.remove(&revno).as_ref() != Some(id) {
            return Err(InvariantViolation::IndexMismatch(id.clone()));
        }
        self.entries.remove(id);
        self.tombstones -= 1;
        Ok(true)
    }

    /// Every entry mutated after `revno`, oldest change first, plus the
    /// revno to use as the next baseline.
    ///
    /// An entity mutated several times after `revno` appears once, with its
    /// latest state.
    pub fn changes_since(&self, revno: i64) -> ChangeSet {
        let deltas = self
            .sequence
            .range((Bound::Excluded(revno), Bound::Unbounded))
            .filter_map(|(_, id)| self.entries.get(id))
            .map(|entry| Delta {
                removed: entry.removed,
                entity: Arc::clone(&entry.info),
            })
            .collect();
        ChangeSet {
            deltas,
            revno: self.latest_revno,
        }
    }

    /// Whether any retained entry was mutated after `revno`.
    pub fn has_changes_since(&self, revno: i64) -> bool {
        self.sequence
            .range((Bound::Excluded(revno), Bound::Unbounded))
            .next()
            .is_some()
    }

    /// Delete tombstones with revno ≤ `low_water` that were removed at least
    /// `grace` before `now`. Returns how many were deleted.
    pub fn collect_garbage(
        &mut self,
        low_water: i64,
        grace: Duration,
        now: Instant,
    ) -> Result<usize, InvariantViolation> {
        if self.tombstones == 0 {
            return Ok(0);
        }
        let expired: Vec<EntityId> = self
            .sequence
            .range(..=low_water)
            .filter(|(_, id)| {
                self.entries.get(*id).is_some_and(|entry| {
                    entry.removed
                        && entry
                            .removed_at
                            .is_some_and(|at| now.saturating_duration_since(at) >= grace)
                })
            })
            .map(|(_, id)| id.clone())
            .collect();

        for id in &expired {
            self.delete(id)?;
        }
        if !expired.is_empty() {
            tracing::debug!(deleted = expired.len(), low_water, "tombstones collected");
        }
        Ok(expired.len())
    }

    /// Verify the sequence and the index describe the same entries.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.sequence.len() != self.entries.len() {
            return Err(InvariantViolation::SizeMismatch {
                sequence: self.sequence.len(),
                index: self.entries.len(),
            });
        }
        for (id, entry) in &self.entries {
            if self.sequence.get(&entry.revno) != Some(id) {
                return Err(InvariantViolation::IndexMismatch(id.clone()));
            }
            if entry.revno > self.latest_revno {
                return Err(InvariantViolation::RevnoAhead {
                    id: id.clone(),
                    revno: entry.revno,
                    latest: self.latest_revno,
                });
            }
        }
        Ok(())
    }

    /// Mark an entry removed and move it to the most recent position.
    fn mark_removed(&mut self, id: &EntityId) -> Option<i64> {
        let entry = self.entries.get_mut(id)?;
        if entry.removed {
            return None;
        }
        entry.removed = true;
        entry.removed_at = Some(Instant::now());
        self.tombstones += 1;
        Some(self.bump(id))
    }

    /// Replace an existing entry's snapshot and move it to the front.
    fn replace(&mut self, id: &EntityId, info: SharedInfo) -> i64 {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.removed {
                entry.removed = false;
                entry.removed_at = None;
                self.tombstones -= 1;
            }
            entry.info = info;
        }
        self.bump(id)
    }

    /// Give an existing entry the next revno.
    fn bump(&mut self, id: &EntityId) -> i64 {
        self.latest_revno += 1;
        let revno = self.latest_revno;
        if let Some(entry) = self.entries.get_mut(id) {
            self.sequence.remove(&entry.revno);
            entry.revno = revno;
            self.sequence.insert(revno, id.clone());
        }
        revno
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("latest_revno", &self.latest_revno)
            .field("entries", &self.entries.len())
            .field("tombstones", &self.tombstones)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use statewatch_types::{MachineInfo, ServiceInfo, default_registry};

    use super::*;
    use crate::memory::MemoryBackend;

    fn setup() -> (Arc<MemoryBackend>, EntityStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = EntityStore::new(Arc::new(default_registry()), backend.clone());
        (backend, store)
    }

    fn machine(id: &str, instance: &str) -> SharedInfo {
        Arc::new(MachineInfo {
            id: id.into(),
            instance_id: instance.into(),
        })
    }

    fn machine_id(id: &str) -> EntityId {
        EntityId::new("machines", id)
    }

    #[test]
    fn test_add_then_changes_since_zero() {
        let (_, mut store) = setup();
        assert_eq!(store.add(machine_id("0"), machine("0", "")), 1);

        let set = store.changes_since(0);
        assert_eq!(set.revno, 1);
        assert_eq!(set.deltas, vec![Delta::change(machine("0", ""))]);
        assert!(store.changes_since(1).deltas.is_empty());
    }

    #[tokio::test]
    async fn test_update_moves_entry_and_coalesces() {
        let (backend, mut store) = setup();
        store.add(machine_id("0"), machine("0", ""));
        store.add(machine_id("1"), machine("1", ""));

        backend.put_silently("machines", "0", json!({ "id": "0", "instanceId": "i-0" }));
        assert_eq!(store.update(&machine_id("0")).await.unwrap(), Some(3));

        let since_two = store.changes_since(2);
        assert_eq!(since_two.deltas, vec![Delta::change(machine("0", "i-0"))]);
        assert_eq!(since_two.revno, 3);

        // Machine 0 appears once with its latest state, after machine 1.
        let since_zero = store.changes_since(0);
        assert_eq!(
            since_zero.deltas,
            vec![Delta::change(machine("1", "")), Delta::change(machine("0", "i-0"))]
        );
        store.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_update_unseen_missing_document_is_noop() {
        let (_, mut store) = setup();
        assert_eq!(store.update(&machine_id("9")).await.unwrap(), None);
        assert_eq!(store.latest_revno(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_unseen_present_document_adds() {
        let (backend, mut store) = setup();
        backend.put_silently("services", "mysql", json!({ "name": "mysql", "exposed": true }));

        let id = EntityId::new("services", "mysql");
        assert_eq!(store.update(&id).await.unwrap(), Some(1));
        let info = store.info(&id).unwrap();
        assert!(info.downcast_ref::<ServiceInfo>().unwrap().exposed);
    }

    #[tokio::test]
    async fn test_unchanged_document_does_not_bump() {
        let (backend, mut store) = setup();
        backend.put_silently("machines", "0", json!({ "id": "0" }));
        assert_eq!(store.update(&machine_id("0")).await.unwrap(), Some(1));
        assert_eq!(store.update(&machine_id("0")).await.unwrap(), None);
        assert_eq!(store.latest_revno(), 1);
    }

    #[tokio::test]
    async fn test_removal_is_visible_then_idempotent() {
        let (_, mut store) = setup();
        store.add(machine_id("0"), machine("0", "i-0"));

        assert_eq!(store.update(&machine_id("0")).await.unwrap(), Some(2));
        assert!(store.is_removed(&machine_id("0")));
        assert_eq!(
            store.changes_since(1).deltas,
            vec![Delta::removal(machine("0", "i-0"))]
        );

        // A second not-found notification changes nothing.
        assert_eq!(store.update(&machine_id("0")).await.unwrap(), None);
        assert_eq!(store.latest_revno(), 2);
        assert_eq!(store.stats().tombstones, 1);
    }

    #[tokio::test]
    async fn test_removed_entry_revives() {
        let (backend, mut store) = setup();
        store.add(machine_id("0"), machine("0", ""));
        store.update(&machine_id("0")).await.unwrap();
        assert!(store.is_removed(&machine_id("0")));

        backend.put_silently("machines", "0", json!({ "id": "0" }));
        assert_eq!(store.update(&machine_id("0")).await.unwrap(), Some(3));
        assert!(!store.is_removed(&machine_id("0")));
        assert_eq!(store.stats().tombstones, 0);
        assert_eq!(store.changes_since(2).deltas, vec![Delta::change(machine("0", ""))]);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fatal() {
        let (backend, mut store) = setup();
        backend.fail_fetches("machines", "connection reset");
        let err = store.update(&machine_id("0")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Fetch { ref message, .. } if message == "connection reset"
        ));
    }

    #[tokio::test]
    async fn test_unknown_collection_is_fatal() {
        let (_, mut store) = setup();
        let err = store.update(&EntityId::new("widgets", "w")).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn test_mismatched_document_id_rejected() {
        let (backend, mut store) = setup();
        backend.put_silently("machines", "0", json!({ "id": "1" }));
        let err = store.update(&machine_id("0")).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_delete_contract() {
        let (_, mut store) = setup();
        store.add(machine_id("0"), machine("0", ""));

        assert_eq!(
            store.delete(&machine_id("0")),
            Err(InvariantViolation::DeleteLiveEntry(machine_id("0")))
        );
        assert_eq!(store.delete(&machine_id("absent")), Ok(false));

        store.update(&machine_id("0")).await.unwrap();
        assert_eq!(store.delete(&machine_id("0")), Ok(true));
        assert_eq!(store.delete(&machine_id("0")), Ok(false));
        assert!(store.is_empty());
        assert_eq!(store.latest_revno(), 2);
        store.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_load_all_assigns_revnos_across_kinds() {
        let (backend, mut store) = setup();
        backend.put_silently("machines", "0", json!({ "id": "0" }));
        backend.put_silently("machines", "1", json!({ "id": "1" }));
        backend.put_silently("services", "mysql", json!({ "name": "mysql" }));

        assert_eq!(store.load_all().await.unwrap(), 3);
        assert_eq!(store.latest_revno(), 3);
        let kinds: Vec<_> = store.changes_since(0).deltas.iter().map(Delta::kind).collect();
        assert_eq!(kinds, vec!["machine", "machine", "service"]);
    }

    #[tokio::test]
    async fn test_load_all_propagates_fetch_errors() {
        let (backend, mut store) = setup();
        backend.fail_fetches("units", "timeout");
        assert!(matches!(store.load_all().await, Err(StoreError::Fetch { .. })));
    }

    #[tokio::test]
    async fn test_load_all_reports_undecodable_document_position() {
        let (backend, mut store) = setup();
        backend.put_silently("machines", "0", json!({ "id": "0" }));
        backend.put_silently("machines", "1", json!({ "id": 5 }));

        let err = store.load_all().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::BadDocument { ref collection, index: 1, .. } if collection == "machines"
        ));
        assert!(err.to_string().starts_with("cannot decode document 1 of machines: "));
    }

    #[tokio::test]
    async fn test_collect_garbage_respects_low_water_and_grace() {
        let (_, mut store) = setup();
        store.add(machine_id("0"), machine("0", ""));
        store.add(machine_id("1"), machine("1", ""));
        store.update(&machine_id("0")).await.unwrap(); // revno 3, removed

        let now = Instant::now();
        // A pending session still at revno 2 needs the tombstone.
        assert_eq!(store.collect_garbage(2, Duration::ZERO, now).unwrap(), 0);
        // Grace window not yet elapsed.
        assert_eq!(store.collect_garbage(3, Duration::from_secs(3600), now).unwrap(), 0);
        assert_eq!(store.collect_garbage(3, Duration::ZERO, now).unwrap(), 1);

        assert!(!store.contains(&machine_id("0")));
        assert!(store.contains(&machine_id("1")));
        assert!(store.changes_since(2).deltas.is_empty());
        assert!(!store.has_changes_since(2));
        assert_eq!(store.latest_revno(), 3);
        store.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_revnos_strictly_increase() {
        let (backend, mut store) = setup();
        let mut last = 0;
        for step in 0..20 {
            let id = format!("{}", step % 4);
            if step % 3 == 0 {
                backend.remove("machines", &id);
            } else {
                let doc = json!({ "id": id, "instanceId": format!("i-{step}") });
                backend.put_silently("machines", &id, doc);
            }
            if let Some(revno) = store.update(&machine_id(&id)).await.unwrap() {
                assert!(revno > last, "revno {revno} not above {last}");
                last = revno;
            }
            store.check_invariants().unwrap();
        }
        assert_eq!(store.latest_revno(), last);
    }
}

//! Collection → entity kind lookup table.
//!
//! The registry replaces per-kind branching: the cache asks it how to decode
//! a document from a collection, and the wire decoder asks it how to decode a
//! payload of a given kind. Adding a kind is one `register` call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::entity::{
    collections, Entity, MachineInfo, RelationInfo, ServiceInfo, SharedInfo, UnitInfo,
};

/// Errors from registry lookups and registration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No descriptor registered for this collection.
    #[error("unknown entity collection: {0}")]
    UnknownKind(String),

    /// No descriptor registered for this kind tag.
    #[error("unknown entity kind tag: {0}")]
    UnknownTag(String),

    /// Collection already registered.
    #[error("collection already registered: {0}")]
    DuplicateCollection(String),

    /// Kind tag already claimed by another collection.
    #[error("kind {kind:?} already registered for collection {collection}")]
    DuplicateKind { kind: &'static str, collection: String },
}

type DecodeFn = fn(serde_json::Value) -> Result<SharedInfo, serde_json::Error>;

/// Descriptor for one entity kind.
#[derive(Clone, Debug)]
pub struct EntityKind {
    collection: String,
    kind: &'static str,
    decode: DecodeFn,
}

impl EntityKind {
    /// Descriptor for snapshot type `T` stored in `collection`.
    pub fn of<T: Entity>(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            kind: T::KIND,
            decode: decode_as::<T>,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Build a fresh snapshot from a backing-store document or wire payload.
    pub fn decode(&self, doc: serde_json::Value) -> Result<SharedInfo, serde_json::Error> {
        (self.decode)(doc)
    }
}

fn decode_as<T: Entity>(doc: serde_json::Value) -> Result<SharedInfo, serde_json::Error> {
    let info: T = serde_json::from_value(doc)?;
    Ok(Arc::new(info))
}

/// Lookup table from collection name (and kind tag) to [`EntityKind`].
///
/// Populated once before the aggregator starts and read-only afterwards.
/// Collections iterate in name order so baseline loads are deterministic.
#[derive(Clone, Debug, Default)]
pub struct KindRegistry {
    by_collection: BTreeMap<String, EntityKind>,
    by_kind: HashMap<&'static str, String>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register snapshot type `T` for `collection`.
    pub fn register<T: Entity>(
        &mut self,
        collection: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.register_kind(EntityKind::of::<T>(collection))
    }

    /// Register a prebuilt descriptor.
    pub fn register_kind(&mut self, kind: EntityKind) -> Result<(), RegistryError> {
        if self.by_collection.contains_key(&kind.collection) {
            return Err(RegistryError::DuplicateCollection(kind.collection));
        }
        if let Some(existing) = self.by_kind.get(kind.kind) {
            return Err(RegistryError::DuplicateKind {
                kind: kind.kind,
                collection: existing.clone(),
            });
        }
        self.insert(kind);
        Ok(())
    }

    fn insert(&mut self, kind: EntityKind) {
        self.by_kind.insert(kind.kind, kind.collection.clone());
        self.by_collection.insert(kind.collection.clone(), kind);
    }

    /// Descriptor for a collection.
    pub fn kind_for(&self, collection: &str) -> Result<&EntityKind, RegistryError> {
        self.by_collection
            .get(collection)
            .ok_or_else(|| RegistryError::UnknownKind(collection.to_string()))
    }

    /// Descriptor for a wire kind tag.
    pub fn kind_by_tag(&self, kind: &str) -> Result<&EntityKind, RegistryError> {
        self.by_kind
            .get(kind)
            .and_then(|collection| self.by_collection.get(collection))
            .ok_or_else(|| RegistryError::UnknownTag(kind.to_string()))
    }

    /// Registered collection names, in order.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.by_collection.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_collection.is_empty()
    }
}

/// Registry with every built-in kind under its conventional collection.
pub fn default_registry() -> KindRegistry {
    let mut registry = KindRegistry::new();
    for kind in [
        EntityKind::of::<MachineInfo>(collections::MACHINES),
        EntityKind::of::<ServiceInfo>(collections::SERVICES),
        EntityKind::of::<UnitInfo>(collections::UNITS),
        EntityKind::of::<RelationInfo>(collections::RELATIONS),
    ] {
        registry.insert(kind);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry_covers_builtin_kinds() {
        let registry = default_registry();
        let collections: Vec<_> = registry.collections().collect();
        assert_eq!(collections, vec!["machines", "relations", "services", "units"]);
        assert_eq!(registry.kind_for("machines").unwrap().kind(), "machine");
        assert_eq!(registry.kind_by_tag("unit").unwrap().collection(), "units");
        for collection in registry.collections() {
            let kind = registry.kind_for(collection).unwrap().kind();
            assert_eq!(registry.kind_by_tag(kind).unwrap().collection(), collection);
        }
    }

    #[test]
    fn test_unknown_collection() {
        let registry = default_registry();
        assert_eq!(
            registry.kind_for("annotations").unwrap_err(),
            RegistryError::UnknownKind("annotations".into())
        );
        assert!(matches!(
            registry.kind_by_tag("annotation"),
            Err(RegistryError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = KindRegistry::new();
        registry.register::<MachineInfo>("machines").unwrap();
        assert_eq!(
            registry.register::<ServiceInfo>("machines").unwrap_err(),
            RegistryError::DuplicateCollection("machines".into())
        );
        assert!(matches!(
            registry.register::<MachineInfo>("machines-v2"),
            Err(RegistryError::DuplicateKind { kind: "machine", .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_decode_through_descriptor() {
        let registry = default_registry();
        let info = registry
            .kind_for("machines")
            .unwrap()
            .decode(json!({ "id": "7", "instanceId": "i-7" }))
            .unwrap();
        assert_eq!(info.entity_kind(), "machine");
        assert_eq!(info.entity_id(), "7");
    }

    #[test]
    fn test_decode_rejects_malformed_document() {
        let registry = default_registry();
        let err = registry
            .kind_for("machines")
            .unwrap()
            .decode(json!({ "instanceId": 12 }));
        assert!(err.is_err());
    }
}

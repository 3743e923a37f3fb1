//! Shared entity and delta types for statewatch.
//!
//! This crate is the leaf of the workspace: entity snapshots, the kind
//! registry that maps backing-store collections to snapshot types, and the
//! wire encoding of deltas. It has no async or storage dependencies.
//!
//! # Overview
//!
//! ```text
//! collection "machines" ──▶ KindRegistry ──▶ EntityKind { kind: "machine", decode }
//!                                                  │
//!                          document (JSON) ────────┘──▶ Arc<dyn EntityInfo>
//!                                                              │
//!                                         Delta { removed, entity }
//!                                                              │
//!                                   wire: ["machine", "change", {...}]
//! ```
//!
//! # Key Types
//!
//! |------------------|---------------------------------------------------|
//! | Type             | Purpose                                           |
//! |------------------|---------------------------------------------------|
//! | [`EntityId`]     | Collection + document id, the cache key           |
//! | [`EntityInfo`]   | Object-safe immutable snapshot of one entity      |
//! | [`Entity`]       | Concrete snapshot types (blanket `EntityInfo`)    |
//! | [`KindRegistry`] | Collection → kind descriptor lookup table         |
//! | [`Delta`]        | One change or removal delivered to clients        |
//! | [`ChangeSet`]    | Deltas plus the revno to poll from next           |
//! |------------------|---------------------------------------------------|

pub mod delta;
pub mod entity;
pub mod registry;

pub use delta::{ChangeSet, ChangeTag, CodecError, Delta, DeltaSeed};
pub use entity::{
    Endpoint, Entity, EntityId, EntityInfo, MachineInfo, RelationInfo, ServiceInfo, SharedInfo,
    UnitInfo, collections,
};
pub use registry::{EntityKind, KindRegistry, RegistryError, default_registry};

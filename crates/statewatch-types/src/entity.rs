//! Entity identities and snapshot types.
//!
//! A snapshot is immutable once constructed. The cache replaces the
//! `Arc<dyn EntityInfo>` on every update instead of editing fields, so a
//! [`Delta`](crate::Delta) handed to a client stays valid after later changes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Collection names for the built-in entity kinds.
pub mod collections {
    pub const MACHINES: &str = "machines";
    pub const SERVICES: &str = "services";
    pub const UNITS: &str = "units";
    pub const RELATIONS: &str = "relations";
}

/// Identity of a document in the backing store.
///
/// Unique key into the cache. A given id always names the same logical
/// entity; ids are never recycled for something else.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntityId {
    /// Backing-store collection the document lives in.
    pub collection: String,
    /// Document id within the collection.
    pub id: String,
}

impl EntityId {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Object-safe view of an entity snapshot.
///
/// Implemented automatically for every [`Entity`]; the cache and the wire
/// codec only ever see `Arc<dyn EntityInfo>`.
pub trait EntityInfo: fmt::Debug + Send + Sync + 'static {
    /// Document id within its collection.
    fn entity_id(&self) -> &str;

    /// Kind tag used on the wire (`"machine"`, `"unit"`, ...).
    fn entity_kind(&self) -> &'static str;

    /// Encode the snapshot as a wire payload.
    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;

    /// True when `other` is the same kind with identical fields.
    fn same_as(&self, other: &dyn EntityInfo) -> bool;
}

impl dyn EntityInfo {
    /// Downcast to a concrete snapshot type.
    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Shared, immutable snapshot handle.
pub type SharedInfo = Arc<dyn EntityInfo>;

/// A concrete snapshot type that can be registered with a
/// [`KindRegistry`](crate::KindRegistry).
///
/// Documents are decoded straight into the implementing type with serde, so
/// field names double as the backing-store document schema.
pub trait Entity:
    fmt::Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind tag, unique across the registry.
    const KIND: &'static str;

    /// Document id within the collection.
    fn id(&self) -> &str;
}

impl<T: Entity> EntityInfo for T {
    fn entity_id(&self) -> &str {
        Entity::id(self)
    }

    fn entity_kind(&self) -> &'static str {
        T::KIND
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_as(&self, other: &dyn EntityInfo) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

// ============================================================================
// Built-in kinds
// ============================================================================

/// A provisioned machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    #[serde(alias = "_id")]
    pub id: String,
    /// Provider instance id; empty until the machine is provisioned.
    #[serde(default)]
    pub instance_id: String,
}

impl Entity for MachineInfo {
    const KIND: &'static str = "machine";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A deployed service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(alias = "_id")]
    pub name: String,
    #[serde(default)]
    pub exposed: bool,
    #[serde(default)]
    pub charm_url: String,
}

impl Entity for ServiceInfo {
    const KIND: &'static str = "service";

    fn id(&self) -> &str {
        &self.name
    }
}

/// One unit of a service, placed on a machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitInfo {
    #[serde(alias = "_id")]
    pub name: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub series: String,
    /// Empty while the unit is unassigned.
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub public_address: String,
    #[serde(default)]
    pub private_address: String,
}

impl Entity for UnitInfo {
    const KIND: &'static str = "unit";

    fn id(&self) -> &str {
        &self.name
    }
}

/// One side of a relation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub service_name: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
}

/// A relation between service endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationInfo {
    #[serde(alias = "_id")]
    pub key: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Entity for RelationInfo {
    const KIND: &'static str = "relation";

    fn id(&self) -> &str {
        &self.key
    }
}

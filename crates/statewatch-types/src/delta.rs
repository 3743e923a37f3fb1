//! Deltas and their wire encoding.
//!
//! On the wire a delta is a three-element array:
//!
//! ```text
//! ["machine", "change", {"id": "0", "instanceId": "i-123"}]
//! ["unit",    "remove", {"name": "wordpress/0", ...}]
//! ```
//!
//! Encoding is a plain `Serialize` impl. Decoding needs to know which
//! snapshot type a kind tag maps to, so it goes through the
//! [`KindRegistry`]: either [`KindRegistry::decode_delta`] on a JSON value or
//! [`DeltaSeed`] for any serde deserializer.

use std::fmt;

use serde::de::{self, DeserializeSeed, Deserializer};
use serde::ser::{self, SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::entity::SharedInfo;
use crate::registry::{KindRegistry, RegistryError};

/// Errors decoding a delta from its wire form.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not a three-element array of the expected element types.
    #[error("bad delta shape: {0}")]
    Shape(String),

    /// Second element is neither `"change"` nor `"remove"`.
    #[error("bad change tag: {0:?}")]
    BadTag(String),

    /// First element names a kind with no registered descriptor.
    #[error(transparent)]
    UnknownKind(#[from] RegistryError),

    /// Payload does not decode as the kind's snapshot type.
    #[error("cannot decode {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Change-vs-remove marker, the middle element of the wire tuple.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeTag {
    /// Entity added or updated.
    Change,
    /// Entity removed from the backing store.
    Remove,
}

/// One change record for one entity.
///
/// Removals carry the last snapshot the cache held before the document
/// disappeared, so clients can tell what went away.
#[derive(Clone)]
pub struct Delta {
    pub removed: bool,
    pub entity: SharedInfo,
}

impl Delta {
    pub fn change(entity: SharedInfo) -> Self {
        Self {
            removed: false,
            entity,
        }
    }

    pub fn removal(entity: SharedInfo) -> Self {
        Self {
            removed: true,
            entity,
        }
    }

    /// Kind tag of the carried entity.
    pub fn kind(&self) -> &'static str {
        self.entity.entity_kind()
    }

    pub fn tag(&self) -> ChangeTag {
        if self.removed {
            ChangeTag::Remove
        } else {
            ChangeTag::Change
        }
    }

    /// Encode to the wire tuple as a JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value, CodecError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl PartialEq for Delta {
    fn eq(&self, other: &Self) -> bool {
        self.removed == other.removed && self.entity.same_as(other.entity.as_ref())
    }
}

impl fmt::Debug for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Delta")
            .field(&self.kind())
            .field(&self.tag())
            .field(&self.entity)
            .finish()
    }
}

impl Serialize for Delta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = self.entity.to_payload().map_err(ser::Error::custom)?;
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(self.kind())?;
        tuple.serialize_element(&self.tag())?;
        tuple.serialize_element(&payload)?;
        tuple.end()
    }
}

impl KindRegistry {
    /// Decode one wire delta, dispatching the payload on its kind tag.
    pub fn decode_delta(&self, value: serde_json::Value) -> Result<Delta, CodecError> {
        let serde_json::Value::Array(items) = value else {
            return Err(CodecError::Shape("expected an array".into()));
        };
        let [kind, tag, payload]: [serde_json::Value; 3] = items
            .try_into()
            .map_err(|items: Vec<_>| {
                CodecError::Shape(format!("expected 3 elements, got {}", items.len()))
            })?;

        let serde_json::Value::String(kind) = kind else {
            return Err(CodecError::Shape("kind must be a string".into()));
        };
        let serde_json::Value::String(tag) = tag else {
            return Err(CodecError::Shape("tag must be a string".into()));
        };
        let tag: ChangeTag = tag.parse().map_err(|_| CodecError::BadTag(tag))?;

        let descriptor = self.kind_by_tag(&kind)?;
        let entity = descriptor
            .decode(payload)
            .map_err(|source| CodecError::Payload { kind, source })?;

        Ok(Delta {
            removed: tag == ChangeTag::Remove,
            entity,
        })
    }

    /// Decode a JSON array of wire deltas.
    pub fn decode_deltas(&self, value: serde_json::Value) -> Result<Vec<Delta>, CodecError> {
        let serde_json::Value::Array(items) = value else {
            return Err(CodecError::Shape("expected an array of deltas".into()));
        };
        items.into_iter().map(|item| self.decode_delta(item)).collect()
    }
}

/// `DeserializeSeed` that decodes a delta through a registry.
///
/// ```ignore
/// let mut de = serde_json::Deserializer::from_str(text);
/// let delta = DeltaSeed::new(&registry).deserialize(&mut de)?;
/// ```
#[derive(Clone, Copy, Debug)]
pub struct DeltaSeed<'a> {
    registry: &'a KindRegistry,
}

impl<'a> DeltaSeed<'a> {
    pub fn new(registry: &'a KindRegistry) -> Self {
        Self { registry }
    }
}

impl<'de> DeserializeSeed<'de> for DeltaSeed<'_> {
    type Value = Delta;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Delta, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        self.registry.decode_delta(value).map_err(de::Error::custom)
    }
}

/// Result of one successful Get: the deltas past the caller's baseline, in
/// ascending revno order, and the revno to pass to the next Get.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeSet {
    pub deltas: Vec<Delta>,
    pub revno: i64,
}

impl ChangeSet {
    /// Decode `{"deltas": [...], "revno": n}`.
    pub fn decode(registry: &KindRegistry, value: serde_json::Value) -> Result<Self, CodecError> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(CodecError::Shape("expected a change set object".into()));
        };
        let revno = map
            .get("revno")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| CodecError::Shape("missing integer revno".into()))?;
        let deltas = registry.decode_deltas(map.remove("deltas").unwrap_or_default())?;
        Ok(Self { deltas, revno })
    }
}

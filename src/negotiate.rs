//! Content negotiation: typed-first decoding with a schema-less fallback.
//!
//! Every payload read from the upstream server passes through a
//! [`Negotiator`]. If the [`Scheme`] has a typed decoder registered for the
//! resource type, that path is attempted first; on failure (or when nothing
//! is registered) the payload is decoded generically into a
//! [`DynamicObject`] tagged with the type identity observed on the wire. Both
//! variants of the resulting [`DecodedObject`] satisfy the same downstream
//! contract, so the rest of the system never branches on which path was
//! taken.

use crate::error::{EdgemuxError, Result};
use crate::scheme::{Scheme, StoredObject};
use crate::types::{ObjectMeta, ResourceKey, ResourceType, TypeIdentity};
use serde::Deserialize;
use std::sync::Arc;

/// A decoded object: either a registered static type or the schema-less
/// fallback representation.
#[derive(Debug, Clone)]
pub enum DecodedObject {
    /// Decoded through a registered typed decoder.
    Typed(Arc<dyn StoredObject>),
    /// Decoded generically; carries the observed type identity.
    Dynamic(DynamicObject),
}

impl DecodedObject {
    /// Observed type identity.
    pub fn type_identity(&self) -> TypeIdentity {
        match self {
            DecodedObject::Typed(object) => object.type_identity(),
            DecodedObject::Dynamic(object) => object.identity.clone(),
        }
    }

    /// Standard object metadata.
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            DecodedObject::Typed(object) => object.metadata(),
            DecodedObject::Dynamic(object) => &object.metadata,
        }
    }

    /// The identity key for this object.
    pub fn key(&self) -> ResourceKey {
        self.metadata().key()
    }

    /// The resource version at which this object was last changed.
    pub fn resource_version(&self) -> u64 {
        self.metadata().resource_version
    }

    /// Re-encodes the object as JSON for transmission upstream.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            DecodedObject::Typed(object) => object.to_json(),
            DecodedObject::Dynamic(object) => Ok(object.body.clone()),
        }
    }

    /// Whether this object took the schema-less decode path.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, DecodedObject::Dynamic(_))
    }
}

/// Schema-less representation of an object of a type not known at build time.
#[derive(Debug, Clone)]
pub struct DynamicObject {
    /// Type identity observed on the wire (`apiVersion` + `kind`).
    pub identity: TypeIdentity,
    /// Parsed standard metadata.
    pub metadata: ObjectMeta,
    /// The full original payload.
    pub body: serde_json::Value,
}

impl DynamicObject {
    /// Builds a dynamic object from a raw JSON payload, extracting the type
    /// identity and standard metadata generically.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Envelope {
            api_version: String,
            kind: String,
            metadata: ObjectMeta,
        }

        let envelope: Envelope = serde_json::from_value(value.clone()).map_err(|e| {
            EdgemuxError::Serialization(format!("schema-less decode failed: {}", e))
        })?;

        Ok(Self {
            identity: TypeIdentity::new(envelope.api_version, envelope.kind),
            metadata: envelope.metadata,
            body: value.clone(),
        })
    }
}

/// Result of decoding a list envelope.
#[derive(Debug)]
pub struct DecodedList {
    /// The decoded items.
    pub objects: Vec<DecodedObject>,
    /// The resource version the list is anchored at.
    pub resource_version: u64,
}

/// Decoder chain for one resource type.
#[derive(Debug, Clone)]
pub struct Negotiator {
    scheme: Arc<Scheme>,
    resource_type: ResourceType,
    fallback: bool,
}

impl Negotiator {
    /// Creates a strict negotiator: only the registered typed path is used
    /// and decode errors surface directly. Used by typed clients.
    pub fn strict(scheme: Arc<Scheme>, resource_type: ResourceType) -> Self {
        Self {
            scheme,
            resource_type,
            fallback: false,
        }
    }

    /// Creates a negotiator with the schema-less fallback enabled. Used by
    /// dynamic clients serving extension types.
    pub fn with_fallback(scheme: Arc<Scheme>, resource_type: ResourceType) -> Self {
        Self {
            scheme,
            resource_type,
            fallback: true,
        }
    }

    /// Decodes a single object payload, trying the typed path first.
    ///
    /// With the fallback enabled, a `Serialization` error is returned only
    /// when both paths fail; without it, typed decode errors surface
    /// directly.
    pub fn decode_object(&self, value: &serde_json::Value) -> Result<DecodedObject> {
        let typed_failure = match self.scheme.decoder(&self.resource_type) {
            Some(decode) => match decode(value) {
                Ok(object) => return Ok(DecodedObject::Typed(object)),
                Err(e) if !self.fallback => return Err(e),
                Err(e) => Some(e),
            },
            None if !self.fallback => {
                return Err(EdgemuxError::Serialization(format!(
                    "no registered type for {}",
                    self.resource_type
                )))
            }
            None => None,
        };

        match DynamicObject::from_value(value) {
            Ok(object) => Ok(DecodedObject::Dynamic(object)),
            Err(dynamic_failure) => match typed_failure {
                Some(typed_failure) => Err(EdgemuxError::Serialization(format!(
                    "both decode paths failed: typed: {}; dynamic: {}",
                    typed_failure, dynamic_failure
                ))),
                None => Err(dynamic_failure),
            },
        }
    }

    /// Decodes a list envelope: `{ "items": [...], "metadata": { "resourceVersion": "N" } }`.
    ///
    /// The same typed-first, schema-less-fallback rule applies to every item.
    pub fn decode_list(&self, value: &serde_json::Value) -> Result<DecodedList> {
        #[derive(Deserialize)]
        struct ListMeta {
            #[serde(rename = "resourceVersion", default)]
            resource_version: String,
        }

        #[derive(Deserialize)]
        struct ListEnvelope {
            #[serde(default)]
            metadata: Option<ListMeta>,
            #[serde(default)]
            items: Vec<serde_json::Value>,
        }

        let envelope: ListEnvelope = serde_json::from_value(value.clone()).map_err(|e| {
            EdgemuxError::Serialization(format!("list envelope decode failed: {}", e))
        })?;

        let resource_version = envelope
            .metadata
            .map(|m| m.resource_version)
            .filter(|rv| !rv.is_empty())
            .map(|rv| {
                rv.parse::<u64>().map_err(|e| {
                    EdgemuxError::Serialization(format!("invalid list resourceVersion: {}", e))
                })
            })
            .transpose()?
            .unwrap_or(0);

        let objects = envelope
            .items
            .iter()
            .map(|item| self.decode_object(item))
            .collect::<Result<Vec<_>>>()?;

        Ok(DecodedList {
            objects,
            resource_version,
        })
    }

    /// The resource type this negotiator serves.
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }
}

//! Registry of statically known resource types.
//!
//! A [`Scheme`] maps resource types to typed decoders. Types registered here
//! take the strongly-typed decode path; everything else falls back to the
//! schema-less representation in [`crate::negotiate`].

use crate::error::{EdgemuxError, Result};
use crate::types::{ObjectMeta, ResourceType, TypeIdentity};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A statically known resource type that can be registered with a [`Scheme`].
pub trait Resource: Debug + Send + Sync {
    /// The `apiVersion` wire form for this type, e.g. `v1` or `group/v1`.
    const API_VERSION: &'static str;
    /// The object kind, e.g. `Pod`.
    const KIND: &'static str;

    /// Standard object metadata.
    fn metadata(&self) -> &ObjectMeta;
}

/// Object-safe view of a decoded, statically typed object.
///
/// Implemented for every [`Resource`] automatically; the rest of the system
/// only ever sees objects through this trait or its schema-less counterpart.
pub trait StoredObject: Debug + Send + Sync {
    /// Observed type identity.
    fn type_identity(&self) -> TypeIdentity;

    /// Standard object metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// Re-encodes the object as JSON.
    fn to_json(&self) -> Result<serde_json::Value>;
}

impl<T: Resource + Serialize> StoredObject for T {
    fn type_identity(&self) -> TypeIdentity {
        TypeIdentity::new(T::API_VERSION, T::KIND)
    }

    fn metadata(&self) -> &ObjectMeta {
        Resource::metadata(self)
    }

    fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(Into::into)
    }
}

type DecodeFn =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn StoredObject>> + Send + Sync>;

/// Thread-safe registry mapping resource types to typed decoders.
#[derive(Default)]
pub struct Scheme {
    decoders: RwLock<HashMap<ResourceType, DecodeFn>>,
}

impl Scheme {
    /// Creates an empty scheme.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` as the statically known type for `resource_type`.
    pub fn register<T>(&self, resource_type: ResourceType)
    where
        T: Resource + Serialize + DeserializeOwned + 'static,
    {
        let decode: DecodeFn = Arc::new(|value| {
            let object: T = serde_json::from_value(value.clone()).map_err(|e| {
                EdgemuxError::Serialization(format!(
                    "typed decode as {} failed: {}",
                    T::KIND,
                    e
                ))
            })?;
            Ok(Arc::new(object) as Arc<dyn StoredObject>)
        });

        self.decoders.write().insert(resource_type, decode);
    }

    /// Looks up the typed decoder for a resource type, if one is registered.
    pub fn decoder(&self, resource_type: &ResourceType) -> Option<DecodeFn> {
        self.decoders.read().get(resource_type).cloned()
    }

    /// Whether a typed decoder is registered for this resource type.
    pub fn is_registered(&self, resource_type: &ResourceType) -> bool {
        self.decoders.read().contains_key(resource_type)
    }
}

impl Debug for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheme")
            .field("registered", &self.decoders.read().len())
            .finish()
    }
}

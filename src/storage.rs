//! The storage contract exposed to request-serving collaborators.

use crate::backend::ResourceBackend;
use crate::error::Result;
use crate::mux::WatchSession;
use crate::negotiate::DecodedObject;
use crate::types::{ResourceKey, Selector};
use async_trait::async_trait;

/// A list result together with the resource version it is anchored at,
/// usable as `from_resource_version` for a subsequent watch.
#[derive(Debug)]
pub struct ListResponse {
    /// Matching objects.
    pub objects: Vec<DecodedObject>,
    /// The snapshot version the objects were read at.
    pub resource_version: u64,
}

/// Read and watch access to one resource type, served from the local cache,
/// plus mutation passthrough to the upstream server.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads one object. `resource_version`, when given, is a freshness
    /// floor: a snapshot older than it yields `Unavailable`.
    async fn get(&self, key: &ResourceKey, resource_version: Option<u64>)
        -> Result<DecodedObject>;

    /// Lists matching objects with their consistency anchor.
    async fn list(
        &self,
        selector: &Selector,
        resource_version: Option<u64>,
    ) -> Result<ListResponse>;

    /// Opens a watch session for events after `from_resource_version`; fails
    /// with `Gone` when that version is below the retained window.
    async fn watch(
        &self,
        selector: &Selector,
        from_resource_version: u64,
    ) -> Result<WatchSession>;

    /// Creates an object upstream. Not cached; the snapshot is updated by
    /// the corresponding watch event.
    async fn create(&self, object: &DecodedObject) -> Result<DecodedObject>;

    /// Replaces an object upstream.
    async fn update(
        &self,
        key: &ResourceKey,
        object: &DecodedObject,
    ) -> Result<DecodedObject>;

    /// Deletes an object upstream.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;
}

#[async_trait]
impl Storage for ResourceBackend {
    async fn get(
        &self,
        key: &ResourceKey,
        resource_version: Option<u64>,
    ) -> Result<DecodedObject> {
        ResourceBackend::get(self, key, resource_version)
    }

    async fn list(
        &self,
        selector: &Selector,
        resource_version: Option<u64>,
    ) -> Result<ListResponse> {
        ResourceBackend::list(self, selector, resource_version)
    }

    async fn watch(
        &self,
        selector: &Selector,
        from_resource_version: u64,
    ) -> Result<WatchSession> {
        ResourceBackend::watch(self, selector.clone(), from_resource_version)
    }

    async fn create(&self, object: &DecodedObject) -> Result<DecodedObject> {
        ResourceBackend::create(self, object).await
    }

    async fn update(
        &self,
        key: &ResourceKey,
        object: &DecodedObject,
    ) -> Result<DecodedObject> {
        ResourceBackend::update(self, key, object).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        ResourceBackend::delete(self, key).await
    }
}

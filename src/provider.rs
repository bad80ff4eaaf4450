//! Process-wide registry of resource backends.
//!
//! The provider resolves a resource type to its backend, creating it lazily
//! on first access. Creation is single-flight by construction: the registry
//! lock is held across client construction and worker start, so two
//! simultaneous first-time callers for the same type can never open two
//! upstream sessions.

use crate::backend::ResourceBackend;
use crate::client::ClientResolver;
use crate::config::{BackoffConfig, CacheConfig, EdgemuxConfig};
use crate::error::{EdgemuxError, Result};
use crate::scheme::Scheme;
use crate::types::ResourceType;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Registry mapping resource types to their backends.
pub struct StorageProvider {
    resolver: ClientResolver,
    cache_config: CacheConfig,
    backoff_config: BackoffConfig,
    backends: Mutex<HashMap<ResourceType, Arc<ResourceBackend>>>,
}

impl StorageProvider {
    /// Creates a provider from configuration and a type scheme.
    pub fn new(config: EdgemuxConfig, scheme: Arc<Scheme>) -> Result<Self> {
        config.validate()?;
        let resolver = ClientResolver::new(config.upstream, scheme)?;

        Ok(Self {
            resolver,
            cache_config: config.cache,
            backoff_config: config.backoff,
            backends: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves the backend for a resource type, creating it on first access.
    ///
    /// `is_dynamic` marks dynamically discovered extension types, which get a
    /// generic client with the schema-less decode fallback. Backends are
    /// cached until explicitly evicted; a failed client construction caches
    /// nothing, so the caller may retry.
    pub async fn resource_storage(
        &self,
        resource_type: &ResourceType,
        is_dynamic: bool,
    ) -> Result<Arc<ResourceBackend>> {
        let mut backends = self.backends.lock().await;
        if let Some(backend) = backends.get(resource_type) {
            return Ok(backend.clone());
        }

        let client = self.resolver.resolve(resource_type, is_dynamic)?;
        let backend = ResourceBackend::new(
            client,
            self.cache_config.clone(),
            self.backoff_config.clone(),
        );
        backend.start();
        backends.insert(resource_type.clone(), backend.clone());

        gauge!("edgemux_backends_active").set(backends.len() as f64);
        info!(resource_type = %resource_type, dynamic = is_dynamic, "Created resource backend");
        Ok(backend)
    }

    /// Tears down the backend for a resource type: stops its reflecting
    /// worker and terminates all its sessions with Gone. Driven by the
    /// extension-type lifecycle collaborator when a type disappears.
    pub async fn evict(&self, resource_type: &ResourceType) -> Result<()> {
        let backend = {
            let mut backends = self.backends.lock().await;
            let backend = backends.remove(resource_type).ok_or_else(|| {
                EdgemuxError::NotFound(format!("no backend for {}", resource_type))
            })?;
            gauge!("edgemux_backends_active").set(backends.len() as f64);
            backend
        };

        backend.shutdown().await;
        info!(resource_type = %resource_type, "Evicted resource backend");
        Ok(())
    }

    /// Whether a backend exists for this resource type.
    pub async fn contains(&self, resource_type: &ResourceType) -> bool {
        self.backends.lock().await.contains_key(resource_type)
    }

    /// Number of live backends.
    pub async fn len(&self) -> usize {
        self.backends.lock().await.len()
    }

    /// Whether any backends exist.
    pub async fn is_empty(&self) -> bool {
        self.backends.lock().await.is_empty()
    }
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProvider").finish_non_exhaustive()
    }
}

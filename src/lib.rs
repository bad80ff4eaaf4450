//! edgemux - an edge-side multiplexed watch cache for cluster resources.
//!
//! edgemux sits between many local readers (node agents, proxies, operators)
//! and a central, authoritative cluster API server. For each distinct
//! resource type it maintains exactly one upstream List+Watch session,
//! replicates the change stream into a bounded, versioned event log, and
//! serves any number of concurrent local Get/List/Watch calls out of that
//! log with correct resource-version semantics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         edgemux                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage Provider: type → backend registry (single-flight)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Resource Backend: reflect worker | event log | snapshot    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Watch Multiplexer: replay + live fan-out per subscriber    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Client Resolver: typed/dynamic REST | content negotiation  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use edgemux::config::EdgemuxConfig;
//! use edgemux::provider::StorageProvider;
//! use edgemux::scheme::Scheme;
//! use edgemux::types::{ResourceType, Selector};
//!
//! #[tokio::main]
//! async fn main() -> edgemux::Result<()> {
//!     let config = EdgemuxConfig::development("http://127.0.0.1:8080");
//!     let provider = StorageProvider::new(config, Arc::new(Scheme::new()))?;
//!
//!     let pods = ResourceType::new("", "v1", "pods");
//!     let backend = provider.resource_storage(&pods, false).await?;
//!     backend.wait_ready().await?;
//!
//!     let list = backend.list(&Selector::all(), None)?;
//!     let mut session = backend.watch(Selector::all(), list.resource_version)?;
//!     while let Some(event) = session.recv().await {
//!         println!("{:?}", event?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod mux;
pub mod negotiate;
pub mod observability;
pub mod provider;
pub mod resilience;
pub mod scheme;
pub mod storage;
pub mod types;

// Re-exports
pub use backend::{BackendState, BackendStatus, ResourceBackend};
pub use cache::{Event, EventKind};
pub use error::{EdgemuxError, Result};
pub use mux::WatchSession;
pub use negotiate::{DecodedObject, DynamicObject};
pub use provider::StorageProvider;
pub use scheme::{Resource, Scheme, StoredObject};
pub use storage::{ListResponse, Storage};
pub use types::{ObjectMeta, ResourceKey, ResourceType, Selector, TypeIdentity};

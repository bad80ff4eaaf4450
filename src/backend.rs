//! Per-resource-type backend: one upstream List+Watch session feeding the
//! cache, any number of local readers served from it.
//!
//! The reflecting worker runs the upstream disruption state machine:
//!
//! - `Connected`: streaming; every received change is applied to the
//!   log/snapshot pair and fanned out.
//! - `Disconnected`: the stream ended or errored; retry the watch from the
//!   last known resource version under capped exponential backoff.
//! - Expired: the upstream reports our version is gone; a fresh full List
//!   rebuilds the cache with a new floor and every session below it is
//!   terminated with Gone.
//! - `Unavailable`: sustained failure past the configured bound; new
//!   Get/List/Watch calls are rejected while reconnection continues in the
//!   background.

use crate::cache::WatchCache;
use crate::client::UpstreamClient;
use crate::config::{BackoffConfig, CacheConfig};
use crate::error::{EdgemuxError, Result};
use crate::mux::{WatchMultiplexer, WatchSession};
use crate::negotiate::DecodedObject;
use crate::resilience::Backoff;
use crate::storage::ListResponse;
use crate::types::{ResourceKey, ResourceType, Selector};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state of a backend's upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Created but the initial List has not completed yet.
    Starting,
    /// Actively streaming from the upstream server.
    Connected,
    /// Upstream session lost; retrying while still serving the snapshot.
    Disconnected,
    /// Sustained failure; new calls are rejected until reconnection.
    Unavailable,
}

/// Point-in-time view of a backend for readiness probes.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    /// Connection state.
    pub state: BackendState,
    /// Resource version the snapshot is currently at.
    pub resource_version: u64,
}

/// Outcome of the watch phase inside the reflect loop.
enum Flow {
    Relist,
    Shutdown,
}

/// The storage backend for one resource type.
pub struct ResourceBackend {
    resource_type: ResourceType,
    client: UpstreamClient,
    cache: WatchCache,
    mux: WatchMultiplexer,
    state: watch::Sender<BackendState>,
    stop: watch::Sender<bool>,
    backoff_config: BackoffConfig,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    worker_starts: AtomicU64,
}

impl ResourceBackend {
    /// Creates a backend. The reflecting worker is not started until
    /// [`start`](Self::start) is called.
    pub fn new(
        client: UpstreamClient,
        cache_config: CacheConfig,
        backoff_config: BackoffConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(BackendState::Starting);
        let (stop, _) = watch::channel(false);

        Arc::new(Self {
            resource_type: client.resource_type().clone(),
            cache: WatchCache::new(cache_config.event_log_capacity),
            mux: WatchMultiplexer::new(cache_config),
            client,
            state,
            stop,
            backoff_config,
            worker: parking_lot::Mutex::new(None),
            worker_starts: AtomicU64::new(0),
        })
    }

    /// Starts the reflecting worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.worker_starts.fetch_add(1, Ordering::Relaxed);
        let backend = self.clone();
        *worker = Some(tokio::spawn(async move { backend.reflect().await }));
    }

    /// The resource type this backend serves.
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Current connection state and snapshot version.
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            state: *self.state.borrow(),
            resource_version: self.cache.snapshot_version(),
        }
    }

    /// How many times the reflecting worker has been started over this
    /// backend's lifetime.
    pub fn worker_starts(&self) -> u64 {
        self.worker_starts.load(Ordering::Relaxed)
    }

    /// Waits for the initial sync to complete. Fails if the backend becomes
    /// unavailable before finishing it.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                BackendState::Connected | BackendState::Disconnected => return Ok(()),
                BackendState::Unavailable => {
                    return Err(EdgemuxError::Unavailable(format!(
                        "{}: upstream unreachable",
                        self.resource_type
                    )))
                }
                BackendState::Starting => {}
            }
            if state.changed().await.is_err() {
                return Err(EdgemuxError::Unavailable(
                    "backend dropped".to_string(),
                ));
            }
        }
    }

    /// Reads one object from the snapshot.
    pub fn get(
        &self,
        key: &ResourceKey,
        resource_version: Option<u64>,
    ) -> Result<DecodedObject> {
        self.ensure_serving()?;
        let (object, snapshot_version) = self.cache.get(key);
        self.ensure_fresh(resource_version, snapshot_version)?;
        object.ok_or_else(|| EdgemuxError::NotFound(format!("{}/{}", self.resource_type, key)))
    }

    /// Lists matching objects from the snapshot, with the snapshot's version
    /// as the consistency anchor for a subsequent watch.
    pub fn list(
        &self,
        selector: &Selector,
        resource_version: Option<u64>,
    ) -> Result<ListResponse> {
        self.ensure_serving()?;
        let (objects, snapshot_version) = self.cache.list(selector);
        self.ensure_fresh(resource_version, snapshot_version)?;
        Ok(ListResponse {
            objects,
            resource_version: snapshot_version,
        })
    }

    /// Opens a watch session for events after `from_resource_version`.
    pub fn watch(&self, selector: Selector, from_resource_version: u64) -> Result<WatchSession> {
        self.ensure_serving()?;
        self.mux.watch(from_resource_version, selector, &self.cache)
    }

    /// Creates an object upstream. The snapshot is updated only by the
    /// corresponding event arriving on the watch path.
    pub async fn create(&self, object: &DecodedObject) -> Result<DecodedObject> {
        self.client.create(object).await
    }

    /// Replaces an object upstream.
    pub async fn update(
        &self,
        key: &ResourceKey,
        object: &DecodedObject,
    ) -> Result<DecodedObject> {
        self.client.update(key, object).await
    }

    /// Deletes an object upstream.
    pub async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.client.delete(key).await
    }

    /// Fan-out statistics for this backend's multiplexer.
    pub fn mux_stats(&self) -> crate::mux::MuxStatsSnapshot {
        self.mux.stats()
    }

    /// Stops the reflecting worker and terminates every session.
    pub async fn shutdown(&self) {
        eprintln!("DBG shutdown: sending stop");
        let _ = self.stop.send(true);
        let worker = self.worker.lock().take();
        eprintln!("DBG shutdown: took worker handle present={}", worker.is_some());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        eprintln!("DBG shutdown: worker joined");
        self.mux.shutdown();
        self.state.send_replace(BackendState::Unavailable);
    }

    fn ensure_serving(&self) -> Result<()> {
        match *self.state.borrow() {
            BackendState::Starting => Err(EdgemuxError::Unavailable(format!(
                "{}: initial sync not complete",
                self.resource_type
            ))),
            BackendState::Unavailable => Err(EdgemuxError::Unavailable(format!(
                "{}: upstream unreachable",
                self.resource_type
            ))),
            BackendState::Connected | BackendState::Disconnected => Ok(()),
        }
    }

    fn ensure_fresh(&self, requested: Option<u64>, snapshot_version: u64) -> Result<()> {
        match requested {
            Some(requested) if requested > snapshot_version => {
                Err(EdgemuxError::Unavailable(format!(
                    "{}: snapshot at {} behind requested resource version {}",
                    self.resource_type, snapshot_version, requested
                )))
            }
            _ => Ok(()),
        }
    }

    fn set_state(&self, next: BackendState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn reflect(self: Arc<Self>) {
        eprintln!("DBG reflect: start");
        let mut stop = self.stop.subscribe();
        let mut backoff = Backoff::new(self.backoff_config.clone());

        'relist: loop {
            eprintln!("DBG reflect: top of relist, stop_value={} sender_rx_count={}, calling list()", *stop.borrow(), self.stop.receiver_count());
            let listed = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => { eprintln!("DBG reflect: stop won at list select"); break 'relist; },
                result = self.client.list() => { eprintln!("DBG reflect: list() returned"); result },
            };

            match listed {
                Ok(list) => {
                    let resource_version = list.resource_version;
                    let count = list.objects.len();
                    self.cache.reset(list.objects, resource_version);
                    self.mux.advance_floor(resource_version);
                    self.set_state(BackendState::Connected);
                    backoff.reset();
                    counter!("edgemux_relists_total").increment(1);
                    info!(
                        resource_type = %self.resource_type,
                        resource_version,
                        objects = count,
                        "Synced full list"
                    );
                }
                Err(error) => {
                    if self.backoff_on_failure(&mut stop, &mut backoff, &error).await {
                        break 'relist;
                    }
                    continue 'relist;
                }
            }

            match self.watch_phase(&mut stop, &mut backoff).await {
                Flow::Relist => continue 'relist,
                Flow::Shutdown => break 'relist,
            }
        }

        self.mux.shutdown();
        self.set_state(BackendState::Unavailable);
        debug!(resource_type = %self.resource_type, "Reflecting worker stopped");
    }

    async fn watch_phase(
        &self,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Flow {
        loop {
            let from = self.cache.last_version();
            let opened = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return Flow::Shutdown,
                result = self.client.watch(from) => result,
            };

            let mut stream = match opened {
                Ok(stream) => {
                    // A successfully opened stream counts as contact with the
                    // upstream: an idle resource whose watches end cleanly
                    // must not creep toward Unavailable.
                    backoff.reset();
                    stream
                }
                Err(EdgemuxError::Expired { resource_version }) => {
                    warn!(
                        resource_type = %self.resource_type,
                        resource_version,
                        "Watch expired; relisting"
                    );
                    return Flow::Relist;
                }
                Err(error) => {
                    if self.backoff_on_failure(stop, backoff, &error).await {
                        return Flow::Shutdown;
                    }
                    continue;
                }
            };

            self.set_state(BackendState::Connected);

            loop {
                let next = tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => return Flow::Shutdown,
                    event = stream.next_event() => event,
                };

                match next {
                    Ok(Some(event)) => {
                        backoff.reset();
                        if self.cache.apply(&event) {
                            counter!("edgemux_events_applied_total").increment(1);
                            self.mux.fan_out(event);
                        }
                    }
                    Ok(None) => {
                        debug!(resource_type = %self.resource_type, "Watch stream ended");
                        let error =
                            EdgemuxError::UpstreamConnection("watch stream ended".to_string());
                        if self.backoff_on_failure(stop, backoff, &error).await {
                            return Flow::Shutdown;
                        }
                        break;
                    }
                    Err(EdgemuxError::Expired { resource_version }) => {
                        warn!(
                            resource_type = %self.resource_type,
                            resource_version,
                            "Watch expired mid-stream; relisting"
                        );
                        return Flow::Relist;
                    }
                    Err(error) => {
                        if self.backoff_on_failure(stop, backoff, &error).await {
                            return Flow::Shutdown;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Records a failure, degrades the state, and sleeps the backoff delay.
    /// Returns `true` when shutdown was requested while sleeping.
    async fn backoff_on_failure(
        &self,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
        error: &EdgemuxError,
    ) -> bool {
        let delay = backoff.next_delay();
        if backoff.failures() >= self.backoff_config.max_failures {
            self.set_state(BackendState::Unavailable);
        } else if *self.state.borrow() != BackendState::Starting {
            // A backend that has never synced keeps rejecting reads rather
            // than serving an empty snapshot as current state.
            self.set_state(BackendState::Disconnected);
        }
        warn!(
            resource_type = %self.resource_type,
            error = %error,
            failures = backoff.failures(),
            delay_ms = delay.as_millis() as u64,
            "Upstream disruption; backing off"
        );

        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

impl std::fmt::Debug for ResourceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBackend")
            .field("resource_type", &self.resource_type)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientResolver;
    use crate::config::UpstreamConfig;
    use crate::scheme::Scheme;

    fn unstarted_backend() -> Arc<ResourceBackend> {
        let resolver = ClientResolver::new(
            UpstreamConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                ..Default::default()
            },
            Arc::new(Scheme::new()),
        )
        .unwrap();
        let client = resolver
            .resolve(&ResourceType::new("", "v1", "pods"), false)
            .unwrap();
        ResourceBackend::new(client, CacheConfig::default(), BackoffConfig::default())
    }

    #[tokio::test]
    async fn test_unstarted_backend_rejects_reads() {
        let backend = unstarted_backend();
        assert_eq!(backend.status().state, BackendState::Starting);

        let err = backend
            .get(&ResourceKey::namespaced("default", "a"), None)
            .unwrap_err();
        assert!(matches!(err, EdgemuxError::Unavailable(_)));

        let err = backend.watch(Selector::all(), 0).unwrap_err();
        assert!(matches!(err, EdgemuxError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_stale_freshness_check() {
        let backend = unstarted_backend();
        // Force the serving state to exercise the freshness check alone.
        backend.set_state(BackendState::Connected);

        let err = backend.list(&Selector::all(), Some(100)).unwrap_err();
        assert!(matches!(err, EdgemuxError::Unavailable(_)));
        assert!(backend.list(&Selector::all(), Some(0)).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_without_start() {
        let backend = unstarted_backend();
        backend.shutdown().await;
        assert_eq!(backend.status().state, BackendState::Unavailable);
        assert_eq!(backend.worker_starts(), 0);
    }
}

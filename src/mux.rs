//! Fan-out of the per-backend event stream to subscriber sessions.
//!
//! The multiplexer carries live events on a broadcast channel and gives every
//! subscriber its own delivery task and bounded sink. A new session first
//! replays buffered events from the log, then switches to live delivery; the
//! subscription to the live channel is taken before the replay is read, and
//! the delivery task discards anything at or below its cursor, so the
//! consumer never observes a gap or a duplicate across the switch.
//!
//! Backpressure is isolated per subscriber: a sink that stays full past the
//! configured wait terminates that session alone, and a session that falls
//! behind the broadcast window is terminated the same way. The reflecting
//! process never blocks on a slow consumer.

use crate::cache::{Event, WatchCache};
use crate::config::CacheConfig;
use crate::error::{EdgemuxError, Result};
use crate::types::Selector;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Control signal observed by every delivery task.
#[derive(Debug, Clone, Copy, Default)]
struct MuxSignal {
    /// Current log floor; sessions whose cursor falls below it are gone.
    floor: u64,
    /// Set when the backend is shutting down.
    shutdown: bool,
}

/// Fan-out statistics.
#[derive(Debug, Default)]
pub struct MuxStats {
    /// Sessions opened over the multiplexer's lifetime.
    pub sessions_opened: AtomicU64,
    /// Currently active sessions.
    pub sessions_active: AtomicU64,
    /// Sessions terminated for overflowing their sink or lagging the live
    /// channel.
    pub overflow_terminations: AtomicU64,
    /// Sessions terminated by a floor advance (upstream watch expired).
    pub gone_terminations: AtomicU64,
}

/// Point-in-time copy of [`MuxStats`].
#[derive(Debug, Clone)]
pub struct MuxStatsSnapshot {
    pub sessions_opened: u64,
    pub sessions_active: u64,
    pub overflow_terminations: u64,
    pub gone_terminations: u64,
}

/// Serves many independent subscriber sessions from one event stream.
pub struct WatchMultiplexer {
    live: broadcast::Sender<Event>,
    signal: watch::Sender<MuxSignal>,
    config: CacheConfig,
    stats: Arc<MuxStats>,
}

impl WatchMultiplexer {
    /// Creates a multiplexer with the given cache configuration.
    pub fn new(config: CacheConfig) -> Self {
        let (live, _) = broadcast::channel(config.broadcast_capacity);
        let (signal, _) = watch::channel(MuxSignal::default());
        Self {
            live,
            signal,
            config,
            stats: Arc::new(MuxStats::default()),
        }
    }

    /// Hands one applied event to every live session.
    ///
    /// Never blocks: sessions that cannot keep up are terminated from their
    /// own delivery tasks.
    pub fn fan_out(&self, event: Event) {
        let _ = self.live.send(event);
    }

    /// Announces a new log floor after a relist; sessions whose cursor is
    /// below it terminate themselves with Gone.
    pub fn advance_floor(&self, floor: u64) {
        self.signal.send_modify(|signal| signal.floor = floor);
    }

    /// Terminates every session; used on backend shutdown.
    pub fn shutdown(&self) {
        self.signal.send_modify(|signal| signal.shutdown = true);
    }

    /// Opens a session for events after `from_resource_version`, replaying
    /// from the cache's log and then following the live channel.
    pub fn watch(
        &self,
        from_resource_version: u64,
        selector: Selector,
        cache: &WatchCache,
    ) -> Result<WatchSession> {
        if self.signal.borrow().shutdown {
            return Err(EdgemuxError::Unavailable("backend shut down".to_string()));
        }

        // Subscribe before reading the replay so nothing can fall between
        // the buffered events and the live stream.
        let live = self.live.subscribe();
        let signal = self.signal.subscribe();
        let replay = cache.replay_since(from_resource_version)?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.sink_capacity);
        let (terminal_tx, terminal_rx) = oneshot::channel();

        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.stats.sessions_active.fetch_add(1, Ordering::Relaxed);
        counter!("edgemux_sessions_opened_total").increment(1);
        gauge!("edgemux_sessions_active")
            .set(self.stats.sessions_active.load(Ordering::Relaxed) as f64);

        let task = DeliveryTask {
            id,
            live,
            signal,
            tx,
            selector,
            cursor: from_resource_version,
            overflow_wait: self.config.overflow_wait,
            stats: self.stats.clone(),
        };
        tokio::spawn(task.run(replay, terminal_tx));

        Ok(WatchSession {
            id,
            receiver: rx,
            terminal: terminal_rx,
            finished: false,
        })
    }

    /// Fan-out statistics for this multiplexer.
    pub fn stats(&self) -> MuxStatsSnapshot {
        MuxStatsSnapshot {
            sessions_opened: self.stats.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.stats.sessions_active.load(Ordering::Relaxed),
            overflow_terminations: self.stats.overflow_terminations.load(Ordering::Relaxed),
            gone_terminations: self.stats.gone_terminations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for WatchMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchMultiplexer")
            .field("sessions_active", &self.stats.sessions_active)
            .finish()
    }
}

/// A consumer's live watch: yields events in strict resource-version order,
/// then at most one terminal error, then `None`.
///
/// Dropping the session cancels its delivery task promptly.
#[derive(Debug)]
pub struct WatchSession {
    id: Uuid,
    receiver: mpsc::Receiver<Event>,
    terminal: oneshot::Receiver<EdgemuxError>,
    finished: bool,
}

impl WatchSession {
    /// Unique session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receives the next event. Buffered events are drained before the
    /// terminal error (if any) is surfaced; after that, returns `None`.
    pub async fn recv(&mut self) -> Option<Result<Event>> {
        if let Some(event) = self.receiver.recv().await {
            return Some(Ok(event));
        }
        if self.finished {
            return None;
        }
        self.finished = true;
        match (&mut self.terminal).await {
            Ok(error) => Some(Err(error)),
            Err(_) => None,
        }
    }

    /// Receives without blocking.
    pub fn try_recv(&mut self) -> Option<Result<Event>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                if self.finished {
                    return None;
                }
                match self.terminal.try_recv() {
                    Ok(error) => {
                        self.finished = true;
                        Some(Err(error))
                    }
                    Err(_) => None,
                }
            }
        }
    }
}

/// One subscriber's delivery worker.
struct DeliveryTask {
    id: Uuid,
    live: broadcast::Receiver<Event>,
    signal: watch::Receiver<MuxSignal>,
    tx: mpsc::Sender<Event>,
    selector: Selector,
    cursor: u64,
    overflow_wait: Duration,
    stats: Arc<MuxStats>,
}

enum Delivery {
    Sent,
    ConsumerGone,
    Overflowed,
}

enum SessionEnd {
    ConsumerGone,
    Overflowed,
    Gone { floor: u64 },
    Shutdown,
}

impl DeliveryTask {
    async fn run(mut self, replay: Vec<Event>, terminal: oneshot::Sender<EdgemuxError>) {
        let outcome = self.deliver_all(replay).await;
        match outcome {
            SessionEnd::ConsumerGone => {
                debug!(session = %self.id, "Watch session closed by consumer");
            }
            SessionEnd::Overflowed => {
                self.stats
                    .overflow_terminations
                    .fetch_add(1, Ordering::Relaxed);
                counter!("edgemux_session_overflows_total").increment(1);
                warn!(session = %self.id, "Terminating watch session: delivery sink overflowed");
                let _ = terminal.send(EdgemuxError::SubscriberOverflow {
                    session: self.id.to_string(),
                });
            }
            SessionEnd::Gone { floor } => {
                self.stats.gone_terminations.fetch_add(1, Ordering::Relaxed);
                debug!(session = %self.id, floor, "Terminating watch session: cursor below new floor");
                let _ = terminal.send(EdgemuxError::Gone {
                    requested: self.cursor,
                    floor,
                });
            }
            SessionEnd::Shutdown => {
                let _ = terminal.send(EdgemuxError::Unavailable(
                    "backend shut down".to_string(),
                ));
            }
        }

        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        gauge!("edgemux_sessions_active")
            .set(self.stats.sessions_active.load(Ordering::Relaxed) as f64);
    }

    /// Checks the control signal against the current cursor. Consulted
    /// before every delivery, not only on signal wakeups: an event fanned
    /// out after a relist must never reach a session whose cursor predates
    /// the new floor, or the consumer would observe a silent gap.
    fn signal_end(&self) -> Option<SessionEnd> {
        let signal = *self.signal.borrow();
        if signal.shutdown {
            return Some(SessionEnd::Shutdown);
        }
        if signal.floor > self.cursor {
            return Some(SessionEnd::Gone {
                floor: signal.floor,
            });
        }
        None
    }

    async fn deliver_all(&mut self, replay: Vec<Event>) -> SessionEnd {
        for event in replay {
            if let Some(end) = self.signal_end() {
                return end;
            }
            match self.deliver(event).await {
                Delivery::Sent => {}
                Delivery::ConsumerGone => return SessionEnd::ConsumerGone,
                Delivery::Overflowed => return SessionEnd::Overflowed,
            }
        }

        loop {
            tokio::select! {
                changed = self.signal.changed() => {
                    if changed.is_err() {
                        return SessionEnd::Shutdown;
                    }
                    let _ = self.signal.borrow_and_update();
                    if let Some(end) = self.signal_end() {
                        return end;
                    }
                }
                received = self.live.recv() => match received {
                    Ok(event) => {
                        // Anything at or below the cursor was already covered
                        // by the replay.
                        if event.resource_version <= self.cursor {
                            continue;
                        }
                        if let Some(end) = self.signal_end() {
                            return end;
                        }
                        match self.deliver(event).await {
                            Delivery::Sent => {}
                            Delivery::ConsumerGone => return SessionEnd::ConsumerGone,
                            Delivery::Overflowed => return SessionEnd::Overflowed,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session = %self.id, skipped, "Watch session lagged the live channel");
                        return SessionEnd::Overflowed;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return SessionEnd::Shutdown;
                    }
                },
                _ = self.tx.closed() => {
                    return SessionEnd::ConsumerGone;
                }
            }
        }
    }

    async fn deliver(&mut self, event: Event) -> Delivery {
        let resource_version = event.resource_version;
        if event.matches(&self.selector) {
            match self.tx.send_timeout(event, self.overflow_wait).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => return Delivery::Overflowed,
                Err(SendTimeoutError::Closed(_)) => return Delivery::ConsumerGone,
            }
        }
        self.cursor = resource_version;
        Delivery::Sent
    }
}

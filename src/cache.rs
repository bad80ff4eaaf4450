//! The versioned event log and materialized snapshot behind each backend.
//!
//! A [`WatchCache`] pairs a bounded [`EventLog`] with a [`Snapshot`] of
//! current state behind one lock, so every append updates both atomically.
//! The cache has exactly one writer (the backend's reflecting worker) and
//! many concurrent readers (Get/List calls and watch replay); readers never
//! observe a torn update.

use crate::error::{EdgemuxError, Result};
use crate::negotiate::DecodedObject;
use crate::types::{ResourceKey, Selector};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Object created.
    Added,
    /// Object updated.
    Modified,
    /// Object deleted.
    Deleted,
    /// Progress marker carrying only a resource version, no object change.
    Bookmark,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Added => write!(f, "ADDED"),
            EventKind::Modified => write!(f, "MODIFIED"),
            EventKind::Deleted => write!(f, "DELETED"),
            EventKind::Bookmark => write!(f, "BOOKMARK"),
        }
    }
}

/// An immutable change record replicated from the upstream watch stream.
#[derive(Debug, Clone)]
pub struct Event {
    /// The change kind.
    pub kind: EventKind,
    /// The object payload; absent for bookmarks.
    pub object: Option<DecodedObject>,
    /// The resource version assigned to this change by the upstream server.
    pub resource_version: u64,
}

impl Event {
    /// Builds a change event from a decoded object.
    pub fn new(kind: EventKind, object: DecodedObject) -> Self {
        let resource_version = object.resource_version();
        Self {
            kind,
            object: Some(object),
            resource_version,
        }
    }

    /// Builds a bookmark event carrying only a resource version.
    pub fn bookmark(resource_version: u64) -> Self {
        Self {
            kind: EventKind::Bookmark,
            object: None,
            resource_version,
        }
    }

    /// Whether this event's object matches the selector. Bookmarks always
    /// pass, since they carry no object to select on.
    pub fn matches(&self, selector: &Selector) -> bool {
        match &self.object {
            Some(object) => selector.matches(object.metadata()),
            None => true,
        }
    }
}

/// Bounded, strictly-ordered sequence of events.
///
/// `floor_version` is the resource version immediately below the oldest
/// retained entry; a watch request below the floor cannot be served from the
/// log and must re-List.
#[derive(Debug)]
struct EventLog {
    entries: VecDeque<Event>,
    capacity: usize,
    floor_version: u64,
}

impl EventLog {
    fn new(capacity: usize, floor_version: u64) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            floor_version,
        }
    }

    fn append(&mut self, event: Event) {
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.floor_version = evicted.resource_version;
            }
        }
        self.entries.push_back(event);
    }

    fn last_version(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.resource_version)
            .unwrap_or(self.floor_version)
    }

    fn replay_since(&self, from: u64) -> Result<Vec<Event>> {
        if from < self.floor_version {
            return Err(EdgemuxError::Gone {
                requested: from,
                floor: self.floor_version,
            });
        }

        Ok(self
            .entries
            .iter()
            .filter(|e| e.resource_version > from)
            .cloned()
            .collect())
    }
}

/// Materialized current state: object identity to latest object.
///
/// Each stored object carries the resource version of its last change in its
/// own metadata; `version` is the version of the most recent event applied to
/// the snapshot as a whole.
#[derive(Debug, Default)]
struct Snapshot {
    objects: HashMap<ResourceKey, DecodedObject>,
    version: u64,
}

struct CacheInner {
    log: EventLog,
    snapshot: Snapshot,
}

/// The single-writer log/snapshot pair for one resource type.
pub struct WatchCache {
    inner: RwLock<CacheInner>,
}

impl WatchCache {
    /// Creates an empty cache. The floor starts at zero; the first
    /// [`reset`](Self::reset) from the initial List establishes the real
    /// anchor.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                log: EventLog::new(capacity, 0),
                snapshot: Snapshot::default(),
            }),
        }
    }

    /// Replaces the snapshot and clears the log from a fresh full List.
    ///
    /// The list's resource version becomes both the snapshot version and the
    /// new log floor. No synthetic diff events are generated.
    pub fn reset(&self, objects: Vec<DecodedObject>, resource_version: u64) {
        let mut inner = self.inner.write();
        let capacity = inner.log.capacity;
        inner.log = EventLog::new(capacity, resource_version);
        inner.snapshot = Snapshot {
            objects: objects.into_iter().map(|o| (o.key(), o)).collect(),
            version: resource_version,
        };
    }

    /// Applies one event to the log and snapshot atomically.
    ///
    /// Returns `false` (dropping the event) when its resource version does
    /// not advance past the last applied version, which preserves the
    /// strictly-increasing log invariant and makes re-delivered frames after
    /// a watch retry harmless.
    pub fn apply(&self, event: &Event) -> bool {
        let mut inner = self.inner.write();

        let last = inner.snapshot.version.max(inner.log.last_version());
        if event.resource_version <= last {
            warn!(
                resource_version = event.resource_version,
                last, "Dropping out-of-order event"
            );
            return false;
        }

        match (&event.kind, &event.object) {
            (EventKind::Bookmark, _) => {
                // Advances the acknowledged version only; bookmarks carry no
                // object and never enter the log or snapshot.
                inner.snapshot.version = event.resource_version;
                return true;
            }
            (EventKind::Deleted, Some(object)) => {
                inner.snapshot.objects.remove(&object.key());
            }
            (_, Some(object)) => {
                inner.snapshot.objects.insert(object.key(), object.clone());
            }
            (kind, None) => {
                warn!(kind = %kind, "Dropping change event without object payload");
                return false;
            }
        }

        inner.snapshot.version = event.resource_version;
        inner.log.append(event.clone());
        true
    }

    /// Reads one object and the snapshot version it was read at.
    pub fn get(&self, key: &ResourceKey) -> (Option<DecodedObject>, u64) {
        let inner = self.inner.read();
        (
            inner.snapshot.objects.get(key).cloned(),
            inner.snapshot.version,
        )
    }

    /// Lists matching objects and the snapshot version they were read at.
    pub fn list(&self, selector: &Selector) -> (Vec<DecodedObject>, u64) {
        let inner = self.inner.read();
        let mut objects: Vec<DecodedObject> = inner
            .snapshot
            .objects
            .values()
            .filter(|o| selector.matches(o.metadata()))
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.key().to_string().cmp(&b.key().to_string()));
        (objects, inner.snapshot.version)
    }

    /// Replays buffered events with resource version greater than `from`, in
    /// order. Fails with `Gone` when `from` is below the log floor.
    pub fn replay_since(&self, from: u64) -> Result<Vec<Event>> {
        self.inner.read().log.replay_since(from)
    }

    /// The resource version immediately below the oldest retained log entry.
    pub fn floor_version(&self) -> u64 {
        self.inner.read().log.floor_version
    }

    /// The resource version of the most recently applied event, falling back
    /// to the floor when the log is empty.
    pub fn last_version(&self) -> u64 {
        let inner = self.inner.read();
        inner.snapshot.version.max(inner.log.last_version())
    }

    /// The snapshot's current resource version.
    pub fn snapshot_version(&self) -> u64 {
        self.inner.read().snapshot.version
    }
}

impl std::fmt::Debug for WatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("WatchCache")
            .field("objects", &inner.snapshot.objects.len())
            .field("log_len", &inner.log.entries.len())
            .field("floor_version", &inner.log.floor_version)
            .field("snapshot_version", &inner.snapshot.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::DynamicObject;
    use proptest::prelude::*;

    fn object(name: &str, rv: u64) -> DecodedObject {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Gadget",
            "metadata": { "name": name, "namespace": "default", "resourceVersion": rv.to_string() }
        });
        DecodedObject::Dynamic(DynamicObject::from_value(&body).unwrap())
    }

    fn event(kind: EventKind, name: &str, rv: u64) -> Event {
        Event::new(kind, object(name, rv))
    }

    #[test]
    fn test_apply_updates_snapshot_and_log() {
        let cache = WatchCache::new(8);
        cache.reset(vec![], 10);

        assert!(cache.apply(&event(EventKind::Added, "a", 11)));
        assert!(cache.apply(&event(EventKind::Modified, "a", 12)));

        let (found, version) = cache.get(&ResourceKey::namespaced("default", "a"));
        assert_eq!(found.unwrap().resource_version(), 12);
        assert_eq!(version, 12);
        assert_eq!(cache.floor_version(), 10);
    }

    #[test]
    fn test_delete_removes_from_snapshot() {
        let cache = WatchCache::new(8);
        cache.reset(vec![object("a", 10)], 10);

        assert!(cache.apply(&event(EventKind::Deleted, "a", 11)));
        let (found, version) = cache.get(&ResourceKey::namespaced("default", "a"));
        assert!(found.is_none());
        assert_eq!(version, 11);
    }

    #[test]
    fn test_out_of_order_event_dropped() {
        let cache = WatchCache::new(8);
        cache.reset(vec![], 10);

        assert!(cache.apply(&event(EventKind::Added, "a", 12)));
        assert!(!cache.apply(&event(EventKind::Added, "b", 12)));
        assert!(!cache.apply(&event(EventKind::Added, "c", 11)));
        assert_eq!(cache.last_version(), 12);
    }

    #[test]
    fn test_eviction_advances_floor() {
        let cache = WatchCache::new(2);
        cache.reset(vec![], 10);

        cache.apply(&event(EventKind::Added, "a", 11));
        cache.apply(&event(EventKind::Added, "b", 12));
        assert_eq!(cache.floor_version(), 10);

        cache.apply(&event(EventKind::Added, "c", 13));
        assert_eq!(cache.floor_version(), 11);

        // Below the floor: Gone.
        let err = cache.replay_since(10).unwrap_err();
        assert!(matches!(err, EdgemuxError::Gone { requested: 10, floor: 11 }));

        // At the floor: full retained window.
        let replay = cache.replay_since(11).unwrap();
        assert_eq!(
            replay.iter().map(|e| e.resource_version).collect::<Vec<_>>(),
            vec![12, 13]
        );
    }

    #[test]
    fn test_bookmark_advances_version_without_entering_log() {
        let cache = WatchCache::new(8);
        cache.reset(vec![], 10);

        assert!(cache.apply(&Event::bookmark(15)));
        assert_eq!(cache.snapshot_version(), 15);
        assert_eq!(cache.last_version(), 15);
        assert!(cache.replay_since(10).unwrap().is_empty());

        // A stale bookmark is dropped like any other out-of-order event.
        assert!(!cache.apply(&Event::bookmark(14)));
    }

    #[test]
    fn test_reset_replaces_state() {
        let cache = WatchCache::new(8);
        cache.reset(vec![object("a", 10)], 10);
        cache.apply(&event(EventKind::Added, "b", 11));

        cache.reset(vec![object("c", 20)], 20);
        assert_eq!(cache.floor_version(), 20);
        assert_eq!(cache.snapshot_version(), 20);

        let (objects, version) = cache.list(&Selector::all());
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].metadata().name, "c");
        assert_eq!(version, 20);

        assert!(cache.replay_since(11).is_err());
    }

    #[test]
    fn test_list_applies_selector() {
        let cache = WatchCache::new(8);
        cache.reset(vec![], 10);

        let labelled = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Gadget",
            "metadata": {
                "name": "a", "namespace": "default", "resourceVersion": "11",
                "labels": { "app": "web" }
            }
        });
        cache.apply(&Event::new(
            EventKind::Added,
            DecodedObject::Dynamic(DynamicObject::from_value(&labelled).unwrap()),
        ));
        cache.apply(&event(EventKind::Added, "b", 12));

        let (objects, _) = cache.list(&Selector::all().with_label("app", "web"));
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].metadata().name, "a");

        let (objects, _) = cache.list(&Selector::all().with_namespace("other"));
        assert!(objects.is_empty());
    }

    proptest! {
        // For any strictly increasing event sequence, any capacity, and any
        // starting version, replay yields exactly the retained subsequence
        // above the start, in order, or Gone when the start is below the
        // floor.
        #[test]
        fn prop_replay_is_exact_ordered_subsequence(
            deltas in proptest::collection::vec(1u64..5, 1..40),
            capacity in 1usize..16,
            from_offset in 0u64..200,
        ) {
            let anchor = 10u64;
            let cache = WatchCache::new(capacity);
            cache.reset(vec![], anchor);

            let mut versions = Vec::new();
            let mut rv = anchor;
            for (i, delta) in deltas.iter().enumerate() {
                rv += delta;
                versions.push(rv);
                let key = format!("o{}", i);
                prop_assert!(cache.apply(&event(EventKind::Added, &key, rv)));
            }

            let from = anchor + from_offset;
            let floor = cache.floor_version();

            match cache.replay_since(from) {
                Err(EdgemuxError::Gone { requested, floor: reported }) => {
                    prop_assert!(from < floor);
                    prop_assert_eq!(requested, from);
                    prop_assert_eq!(reported, floor);
                }
                Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {}", e))),
                Ok(replay) => {
                    prop_assert!(from >= floor);
                    let expected: Vec<u64> = versions
                        .iter()
                        .copied()
                        .filter(|v| *v > from)
                        .collect();
                    let got: Vec<u64> = replay.iter().map(|e| e.resource_version).collect();
                    prop_assert_eq!(got.clone(), expected);
                    // Strictly increasing, no duplicates.
                    prop_assert!(got.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }
}

//! # Thread-Safe Property Cache
//!
//! Per-sub-tree storage for replicated object state: location, orientation,
//! bounds, mesh, physics, parent and epoch, each independently
//! sequence-versioned. One cache instance exists per replicated sub-tree and
//! is the only mutable structure shared between the replication context that
//! writes it and the context that delivers user-visible notifications.
//!
//! ## Lifetime protocol
//!
//! Every entry carries an `exists` flag and a `tracking` count. Mutations set
//! values and queue a listener notification; the notification holds a
//! tracking reference until it has been delivered, and read access from other
//! contexts takes a tracking lease via [`PropertyCache::start_tracking`].
//! An entry is evicted exactly when `exists == false && tracking == 0`, so a
//! lease or a queued notification can never dangle.
//!
//! Updates referencing an unknown object are expected under cross-context
//! races and are dropped at debug level, never treated as errors.

use crate::wire::{FieldUpdates, ObjectAddition};
use prox_types::{BoundingSphere, ObjectId, Quaternion, Sequenced, Vec3};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// A full copy of one object's replicated state, with per-field sequence
/// numbers. This is what flows across context boundaries: a value, never a
/// reference into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSnapshot {
    pub object: ObjectId,
    pub parent: Option<Sequenced<ObjectId>>,
    pub location: Sequenced<Vec3>,
    pub orientation: Sequenced<Quaternion>,
    pub bounds: Sequenced<BoundingSphere>,
    pub mesh: Option<Sequenced<String>>,
    pub physics: Option<Sequenced<String>>,
    pub epoch: Option<Sequenced<u64>>,
}

impl ObjectSnapshot {
    /// Converts the snapshot into a field delta, used when a removed entry's
    /// values are parked in the orphan buffer for staleness detection.
    pub fn as_field_updates(&self) -> FieldUpdates {
        FieldUpdates {
            location: Some(self.location.clone()),
            orientation: Some(self.orientation.clone()),
            bounds: Some(self.bounds.clone()),
            mesh: self.mesh.clone(),
            physics: self.physics.clone(),
            parent: self.parent.clone(),
            epoch: self.epoch.clone(),
        }
    }
}

impl From<&ObjectAddition> for ObjectSnapshot {
    fn from(addition: &ObjectAddition) -> Self {
        Self {
            object: addition.object,
            parent: addition.parent.map(|p| Sequenced::new(p, addition.location.seqno)),
            location: addition.location.clone(),
            orientation: addition.orientation.clone(),
            bounds: addition.bounds.clone(),
            mesh: addition.mesh.clone(),
            physics: addition.physics.clone(),
            epoch: None,
        }
    }
}

/// Listener for applied cache updates. Invoked from the delivery context,
/// never from the context that performed the mutation. All methods default to
/// no-ops so implementors only override what they care about.
pub trait PropertyUpdateListener: Send + Sync {
    fn object_added(&self, object: ObjectId) {
        let _ = object;
    }
    fn object_removed(&self, object: ObjectId) {
        let _ = object;
    }
    fn location_updated(&self, object: ObjectId, value: Sequenced<Vec3>) {
        let _ = (object, value);
    }
    fn orientation_updated(&self, object: ObjectId, value: Sequenced<Quaternion>) {
        let _ = (object, value);
    }
    fn bounds_updated(&self, object: ObjectId, value: Sequenced<BoundingSphere>) {
        let _ = (object, value);
    }
    fn mesh_updated(&self, object: ObjectId, value: Sequenced<String>) {
        let _ = (object, value);
    }
    fn physics_updated(&self, object: ObjectId, value: Sequenced<String>) {
        let _ = (object, value);
    }
    fn parent_updated(&self, object: ObjectId, value: Sequenced<ObjectId>) {
        let _ = (object, value);
    }
    fn epoch_updated(&self, object: ObjectId, value: Sequenced<u64>) {
        let _ = (object, value);
    }
}

/// A deferred listener notification, carrying the already-applied value.
#[derive(Debug, Clone)]
enum CacheNotification {
    Added(ObjectId),
    Removed(ObjectId),
    Location(ObjectId, Sequenced<Vec3>),
    Orientation(ObjectId, Sequenced<Quaternion>),
    Bounds(ObjectId, Sequenced<BoundingSphere>),
    Mesh(ObjectId, Sequenced<String>),
    Physics(ObjectId, Sequenced<String>),
    Parent(ObjectId, Sequenced<ObjectId>),
    Epoch(ObjectId, Sequenced<u64>),
}

impl CacheNotification {
    fn object(&self) -> ObjectId {
        match self {
            CacheNotification::Added(o)
            | CacheNotification::Removed(o)
            | CacheNotification::Location(o, _)
            | CacheNotification::Orientation(o, _)
            | CacheNotification::Bounds(o, _)
            | CacheNotification::Mesh(o, _)
            | CacheNotification::Physics(o, _)
            | CacheNotification::Parent(o, _)
            | CacheNotification::Epoch(o, _) => *o,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    snap: ObjectSnapshot,
    /// False once a removal notification has been processed for the entry.
    exists: bool,
    /// In-flight consumers: outstanding read leases plus queued
    /// notifications. The entry survives while this is nonzero.
    tracking: u32,
}

/// Thread-safe, sequence-versioned property store for one replicated
/// sub-tree. Constructed behind an [`Arc`]; mutation and read-lease methods
/// take `&self`.
pub struct PropertyCache {
    /// Human-readable name for log lines (session + index).
    name: String,
    entries: Mutex<HashMap<ObjectId, CacheEntry>>,
    /// Objects whose last removal was permanent (destroyed at the server)
    /// rather than a cut movement. Cleared on re-addition.
    destroyed: Mutex<HashSet<ObjectId>>,
    listeners: Mutex<Vec<Arc<dyn PropertyUpdateListener>>>,
    pending: Mutex<VecDeque<CacheNotification>>,
    wakeup: Notify,
}

impl std::fmt::Debug for PropertyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyCache").field("name", &self.name).finish()
    }
}

impl PropertyCache {
    /// Creates a new, empty cache. The caller is responsible for pumping
    /// notifications, either by spawning [`PropertyCache::spawn_delivery`] or
    /// by calling [`PropertyCache::deliver_pending`] from its own delivery
    /// context.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(HashSet::new()),
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        })
    }

    /// Registers a listener for applied updates.
    pub fn add_listener(&self, listener: Arc<dyn PropertyUpdateListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Spawns the single-threaded delivery loop for this cache. The task
    /// holds only a weak reference and exits shortly after the last strong
    /// handle is dropped.
    pub fn spawn_delivery(self: &Arc<Self>) {
        let weak: Weak<PropertyCache> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let cache = match weak.upgrade() {
                    Some(cache) => cache,
                    None => break,
                };
                tokio::select! {
                    _ = cache.wakeup.notified() => cache.deliver_pending(),
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Mutations (replication context)
    // ------------------------------------------------------------------

    /// Adds an object with a full snapshot, or resurrects an entry whose
    /// removal is still pending delivery. Snapshot fields never clobber newer
    /// values already present.
    pub fn object_added(&self, snapshot: ObjectSnapshot) {
        let object = snapshot.object;
        {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&object) {
                Some(entry) => {
                    entry.exists = true;
                    entry.tracking += 1;
                    apply_snapshot_if_newer(&mut entry.snap, &snapshot);
                }
                None => {
                    entries.insert(object, CacheEntry { snap: snapshot, exists: true, tracking: 1 });
                }
            }
        }
        self.destroyed.lock().unwrap().remove(&object);
        self.queue(CacheNotification::Added(object));
    }

    /// Marks an object removed and returns a copy of its current values so
    /// the caller can park them for staleness detection. `permanent` records
    /// whether the server destroyed the object, as opposed to the cut moving
    /// away from it; [`PropertyCache::was_destroyed`] reports it until a
    /// re-addition. The entry itself is evicted only once every lease and
    /// queued notification has drained.
    pub fn object_removed(&self, object: ObjectId, permanent: bool) -> Option<ObjectSnapshot> {
        let snapshot = {
            let mut entries = self.entries.lock().unwrap();
            let entry = match entries.get_mut(&object) {
                Some(entry) if entry.exists => entry,
                _ => {
                    debug!(cache = %self.name, %object, "removal for unknown object ignored");
                    return None;
                }
            };
            entry.exists = false;
            entry.tracking += 1;
            entry.snap.clone()
        };
        if permanent {
            self.destroyed.lock().unwrap().insert(object);
        }
        self.queue(CacheNotification::Removed(object));
        Some(snapshot)
    }

    /// Whether the object's most recent removal was permanent. Kept until the
    /// object is added again, so the query side can report a removal that has
    /// already drained from the entry map with the right finality.
    pub fn was_destroyed(&self, object: ObjectId) -> bool {
        self.destroyed.lock().unwrap().contains(&object)
    }

    pub fn location_updated(&self, object: ObjectId, value: Sequenced<Vec3>) -> bool {
        self.apply(object, |snap| {
            snap.location
                .apply_if_newer(value.clone())
                .then(|| CacheNotification::Location(object, value.clone()))
        })
    }

    pub fn orientation_updated(&self, object: ObjectId, value: Sequenced<Quaternion>) -> bool {
        self.apply(object, |snap| {
            snap.orientation
                .apply_if_newer(value.clone())
                .then(|| CacheNotification::Orientation(object, value.clone()))
        })
    }

    pub fn bounds_updated(&self, object: ObjectId, value: Sequenced<BoundingSphere>) -> bool {
        self.apply(object, |snap| {
            snap.bounds
                .apply_if_newer(value.clone())
                .then(|| CacheNotification::Bounds(object, value.clone()))
        })
    }

    pub fn mesh_updated(&self, object: ObjectId, value: Sequenced<String>) -> bool {
        self.apply(object, |snap| {
            apply_optional_if_newer(&mut snap.mesh, value.clone())
                .then(|| CacheNotification::Mesh(object, value.clone()))
        })
    }

    pub fn physics_updated(&self, object: ObjectId, value: Sequenced<String>) -> bool {
        self.apply(object, |snap| {
            apply_optional_if_newer(&mut snap.physics, value.clone())
                .then(|| CacheNotification::Physics(object, value.clone()))
        })
    }

    pub fn parent_updated(&self, object: ObjectId, value: Sequenced<ObjectId>) -> bool {
        self.apply(object, |snap| {
            apply_optional_if_newer(&mut snap.parent, value.clone())
                .then(|| CacheNotification::Parent(object, value.clone()))
        })
    }

    pub fn epoch_updated(&self, object: ObjectId, value: Sequenced<u64>) -> bool {
        self.apply(object, |snap| {
            apply_optional_if_newer(&mut snap.epoch, value.clone())
                .then(|| CacheNotification::Epoch(object, value.clone()))
        })
    }

    /// Applies a whole field delta; returns `true` if any field was applied.
    pub fn apply_field_updates(&self, object: ObjectId, fields: &FieldUpdates) -> bool {
        let mut any = false;
        if let Some(v) = &fields.location {
            any |= self.location_updated(object, v.clone());
        }
        if let Some(v) = &fields.orientation {
            any |= self.orientation_updated(object, v.clone());
        }
        if let Some(v) = &fields.bounds {
            any |= self.bounds_updated(object, v.clone());
        }
        if let Some(v) = &fields.mesh {
            any |= self.mesh_updated(object, v.clone());
        }
        if let Some(v) = &fields.physics {
            any |= self.physics_updated(object, v.clone());
        }
        if let Some(v) = &fields.parent {
            any |= self.parent_updated(object, v.clone());
        }
        if let Some(v) = &fields.epoch {
            any |= self.epoch_updated(object, v.clone());
        }
        any
    }

    // ------------------------------------------------------------------
    // Tracking leases and reads
    // ------------------------------------------------------------------

    /// Takes an iterator-style read lease on an object. Returns `false` when
    /// the object is not currently live, in which case no lease is held.
    pub fn start_tracking(&self, object: ObjectId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&object) {
            Some(entry) if entry.exists => {
                entry.tracking += 1;
                true
            }
            _ => false,
        }
    }

    /// Releases a lease taken with [`PropertyCache::start_tracking`] and
    /// evicts the entry if it was the last reference to a removed object.
    pub fn stop_tracking(&self, object: ObjectId) {
        let mut entries = self.entries.lock().unwrap();
        self.release_locked(&mut entries, object);
    }

    /// Single-read lease variant: same mechanics, separate name so call
    /// sites document whether they hold the lease across iteration.
    pub fn start_simple_tracking(&self, object: ObjectId) -> bool {
        self.start_tracking(object)
    }

    pub fn stop_simple_tracking(&self, object: ObjectId) {
        self.stop_tracking(object)
    }

    /// Whether the object is currently live in this cache.
    pub fn contains(&self, object: ObjectId) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&object)
            .map(|e| e.exists)
            .unwrap_or(false)
    }

    /// Full snapshot of an object's current state. Valid for removed entries
    /// while a lease is outstanding.
    pub fn snapshot(&self, object: ObjectId) -> Option<ObjectSnapshot> {
        self.entries.lock().unwrap().get(&object).map(|e| e.snap.clone())
    }

    pub fn location(&self, object: ObjectId) -> Option<Sequenced<Vec3>> {
        self.entries.lock().unwrap().get(&object).map(|e| e.snap.location.clone())
    }

    pub fn bounds(&self, object: ObjectId) -> Option<Sequenced<BoundingSphere>> {
        self.entries.lock().unwrap().get(&object).map(|e| e.snap.bounds.clone())
    }

    pub fn mesh(&self, object: ObjectId) -> Option<Sequenced<String>> {
        self.entries.lock().unwrap().get(&object).and_then(|e| e.snap.mesh.clone())
    }

    /// IDs of all live objects, for engine iteration.
    pub fn live_objects(&self) -> Vec<ObjectId> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.exists)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether no entry is currently live. Used to decide that a sub-tree's
    /// replica has gone vacant.
    pub fn empty(&self) -> bool {
        !self.entries.lock().unwrap().values().any(|e| e.exists)
    }

    /// Whether the underlying map has no entries at all, live or lingering.
    pub fn fully_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    // ------------------------------------------------------------------
    // Delivery context
    // ------------------------------------------------------------------

    /// Drains queued notifications, invoking listeners with the applied
    /// values and releasing each notification's tracking reference. Must be
    /// called from a single delivery context distinct from mutators.
    pub fn deliver_pending(&self) {
        loop {
            let notification = match self.pending.lock().unwrap().pop_front() {
                Some(n) => n,
                None => break,
            };
            let listeners: Vec<Arc<dyn PropertyUpdateListener>> =
                self.listeners.lock().unwrap().clone();
            for listener in &listeners {
                match &notification {
                    CacheNotification::Added(o) => listener.object_added(*o),
                    CacheNotification::Removed(o) => listener.object_removed(*o),
                    CacheNotification::Location(o, v) => listener.location_updated(*o, v.clone()),
                    CacheNotification::Orientation(o, v) => {
                        listener.orientation_updated(*o, v.clone())
                    }
                    CacheNotification::Bounds(o, v) => listener.bounds_updated(*o, v.clone()),
                    CacheNotification::Mesh(o, v) => listener.mesh_updated(*o, v.clone()),
                    CacheNotification::Physics(o, v) => listener.physics_updated(*o, v.clone()),
                    CacheNotification::Parent(o, v) => listener.parent_updated(*o, v.clone()),
                    CacheNotification::Epoch(o, v) => listener.epoch_updated(*o, v.clone()),
                }
            }
            let mut entries = self.entries.lock().unwrap();
            self.release_locked(&mut entries, notification.object());
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn apply<F>(&self, object: ObjectId, mutate: F) -> bool
    where
        F: FnOnce(&mut ObjectSnapshot) -> Option<CacheNotification>,
    {
        let notification = {
            let mut entries = self.entries.lock().unwrap();
            let entry = match entries.get_mut(&object) {
                Some(entry) if entry.exists => entry,
                _ => {
                    trace!(cache = %self.name, %object, "update for unknown object ignored");
                    return false;
                }
            };
            match mutate(&mut entry.snap) {
                Some(notification) => {
                    entry.tracking += 1;
                    notification
                }
                None => return false, // stale, dropped
            }
        };
        self.queue(notification);
        true
    }

    fn queue(&self, notification: CacheNotification) {
        self.pending.lock().unwrap().push_back(notification);
        self.wakeup.notify_one();
    }

    fn release_locked(&self, entries: &mut HashMap<ObjectId, CacheEntry>, object: ObjectId) {
        if let Some(entry) = entries.get_mut(&object) {
            entry.tracking = entry.tracking.saturating_sub(1);
            if entry.tracking == 0 && !entry.exists {
                entries.remove(&object);
                trace!(cache = %self.name, %object, "evicted");
            }
        }
    }
}

fn apply_optional_if_newer<T>(slot: &mut Option<Sequenced<T>>, update: Sequenced<T>) -> bool {
    match slot {
        Some(current) => current.apply_if_newer(update),
        None => {
            *slot = Some(update);
            true
        }
    }
}

fn apply_snapshot_if_newer(current: &mut ObjectSnapshot, incoming: &ObjectSnapshot) {
    current.location.apply_if_newer(incoming.location.clone());
    current.orientation.apply_if_newer(incoming.orientation.clone());
    current.bounds.apply_if_newer(incoming.bounds.clone());
    if let Some(mesh) = &incoming.mesh {
        apply_optional_if_newer(&mut current.mesh, mesh.clone());
    }
    if let Some(physics) = &incoming.physics {
        apply_optional_if_newer(&mut current.physics, physics.clone());
    }
    if let Some(parent) = &incoming.parent {
        apply_optional_if_newer(&mut current.parent, parent.clone());
    }
    if let Some(epoch) = &incoming.epoch {
        apply_optional_if_newer(&mut current.epoch, epoch.clone());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub(crate) fn snapshot(object: ObjectId, seqno: u64) -> ObjectSnapshot {
        ObjectSnapshot {
            object,
            parent: None,
            location: Sequenced::new(Vec3::new(1.0, 2.0, 3.0), seqno),
            orientation: Sequenced::new(Quaternion::IDENTITY, seqno),
            bounds: Sequenced::new(BoundingSphere::new(Vec3::ZERO, 1.0), seqno),
            mesh: None,
            physics: None,
            epoch: None,
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        locations: StdMutex<Vec<(ObjectId, Sequenced<Vec3>)>>,
        added: StdMutex<Vec<ObjectId>>,
        removed: StdMutex<Vec<ObjectId>>,
    }

    impl PropertyUpdateListener for RecordingListener {
        fn object_added(&self, object: ObjectId) {
            self.added.lock().unwrap().push(object);
        }
        fn object_removed(&self, object: ObjectId) {
            self.removed.lock().unwrap().push(object);
        }
        fn location_updated(&self, object: ObjectId, value: Sequenced<Vec3>) {
            self.locations.lock().unwrap().push((object, value));
        }
    }

    #[test]
    fn stale_sequence_numbers_never_overwrite_newer_values() {
        let cache = PropertyCache::new("test");
        let object = ObjectId::new();
        cache.object_added(snapshot(object, 5));

        assert!(!cache.location_updated(object, Sequenced::new(Vec3::new(9.0, 9.0, 9.0), 3)));
        assert!(!cache.location_updated(object, Sequenced::new(Vec3::new(9.0, 9.0, 9.0), 5)));
        assert_eq!(cache.location(object).unwrap().value, Vec3::new(1.0, 2.0, 3.0));

        assert!(cache.location_updated(object, Sequenced::new(Vec3::new(7.0, 7.0, 7.0), 8)));
        let stored = cache.location(object).unwrap();
        assert_eq!(stored.value, Vec3::new(7.0, 7.0, 7.0));
        assert_eq!(stored.seqno, 8);

        // Fields are versioned independently: a bounds update with a lower
        // number than the location's still applies.
        assert!(cache.bounds_updated(object, Sequenced::new(BoundingSphere::new(Vec3::ZERO, 4.0), 6)));
        assert_eq!(cache.bounds(object).unwrap().value.radius, 4.0);
    }

    #[test]
    fn updates_for_unknown_objects_are_noops() {
        let cache = PropertyCache::new("test");
        let object = ObjectId::new();
        assert!(!cache.location_updated(object, Sequenced::new(Vec3::ZERO, 1)));
        assert!(cache.object_removed(object, false).is_none());
        assert!(!cache.start_simple_tracking(object));
        assert!(cache.fully_empty());
    }

    #[test]
    fn entry_survives_removal_while_lease_outstanding() {
        let cache = PropertyCache::new("test");
        let object = ObjectId::new();
        cache.object_added(snapshot(object, 1));
        cache.deliver_pending();

        assert!(cache.start_tracking(object));
        let parked = cache.object_removed(object, false).expect("removal returns values");
        assert_eq!(parked.location.seqno, 1);
        cache.deliver_pending();

        // Removed but leased: no new leases, reads still work.
        assert!(!cache.start_tracking(object));
        assert!(cache.snapshot(object).is_some());
        assert!(!cache.fully_empty());
        assert!(cache.empty());

        cache.stop_tracking(object);
        assert!(cache.snapshot(object).is_none());
        assert!(cache.fully_empty());
    }

    #[test]
    fn eviction_waits_for_pending_notifications() {
        let cache = PropertyCache::new("test");
        let object = ObjectId::new();
        cache.object_added(snapshot(object, 1));
        cache.object_removed(object, false);

        // Both notifications still queued; the entry must linger.
        assert!(!cache.fully_empty());
        cache.deliver_pending();
        assert!(cache.fully_empty());
    }

    #[test]
    fn listeners_receive_applied_values_in_order() {
        let cache = PropertyCache::new("test");
        let listener = Arc::new(RecordingListener::default());
        cache.add_listener(listener.clone());

        let object = ObjectId::new();
        cache.object_added(snapshot(object, 1));
        cache.location_updated(object, Sequenced::new(Vec3::new(5.0, 0.0, 0.0), 2));
        cache.location_updated(object, Sequenced::new(Vec3::new(6.0, 0.0, 0.0), 1)); // stale
        cache.object_removed(object, false);
        cache.deliver_pending();

        assert_eq!(listener.added.lock().unwrap().as_slice(), &[object]);
        assert_eq!(listener.removed.lock().unwrap().as_slice(), &[object]);
        let locations = listener.locations.lock().unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].1.value, Vec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn readdition_resurrects_without_clobbering_newer_fields() {
        let cache = PropertyCache::new("test");
        let object = ObjectId::new();
        cache.object_added(snapshot(object, 10));
        cache.start_tracking(object); // keep the entry alive across removal
        cache.object_removed(object, false);
        cache.deliver_pending();

        // Re-addition with an older snapshot: entry comes back live, values
        // keep the newer sequence numbers.
        cache.object_added(snapshot(object, 4));
        assert!(cache.contains(object));
        assert_eq!(cache.location(object).unwrap().seqno, 10);
        cache.stop_tracking(object);
        assert!(cache.contains(object));
    }

    #[test]
    fn permanence_is_remembered_until_readdition() {
        let cache = PropertyCache::new("test");
        let object = ObjectId::new();
        cache.object_added(snapshot(object, 1));
        cache.object_removed(object, true);
        cache.deliver_pending();

        // The entry has drained, but the finality of the removal survives.
        assert!(cache.fully_empty());
        assert!(cache.was_destroyed(object));

        // Re-addition means the server recreated it; the flag resets.
        cache.object_added(snapshot(object, 2));
        assert!(!cache.was_destroyed(object));

        // Cut-movement removals never set it.
        cache.object_removed(object, false);
        assert!(!cache.was_destroyed(object));
    }

    #[tokio::test]
    async fn spawned_delivery_loop_pumps_notifications() {
        let cache = PropertyCache::new("test");
        let listener = Arc::new(RecordingListener::default());
        cache.add_listener(listener.clone());
        cache.spawn_delivery();

        let object = ObjectId::new();
        cache.object_added(snapshot(object, 1));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(listener.added.lock().unwrap().len(), 1);
        assert!(cache.contains(object));
    }
}

//! # Orphaned Update Buffering
//!
//! The topology ("prox") and property ("loc") streams for one session are
//! logically independent, so a property delta can arrive before the topology
//! addition that introduces its object to a sub-tree. Each sub-tree owns one
//! [`OrphanedUpdateManager`] that parks such deltas until the addition shows
//! up, then replays them, and ages out entries whose addition never arrives.

use crate::wire::FieldUpdates;
use prox_types::ObjectId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Buffered deltas for one object, with the insertion time of the most
/// recent one for aging.
#[derive(Debug)]
struct OrphanedUpdates {
    updates: Vec<FieldUpdates>,
    last_touched: Instant,
}

/// Per-sub-tree buffer of property deltas for objects the sub-tree's cache
/// does not know yet.
#[derive(Debug, Default)]
pub struct OrphanedUpdateManager {
    orphans: HashMap<ObjectId, OrphanedUpdates>,
}

impl OrphanedUpdateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a delta for an untracked object.
    pub fn add(&mut self, object: ObjectId, fields: FieldUpdates, now: Instant) {
        if fields.is_empty() {
            return;
        }
        let entry = self
            .orphans
            .entry(object)
            .or_insert_with(|| OrphanedUpdates { updates: Vec::new(), last_touched: now });
        entry.updates.push(fields);
        entry.last_touched = now;
    }

    /// Removes and returns every buffered delta for `object`, in arrival
    /// order. Called the moment the matching addition arrives.
    pub fn take(&mut self, object: ObjectId) -> Vec<FieldUpdates> {
        self.orphans.remove(&object).map(|o| o.updates).unwrap_or_default()
    }

    /// Drops entries untouched for longer than `max_age`. Returns how many
    /// objects were aged out.
    pub fn cleanup(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.orphans.len();
        self.orphans.retain(|object, entry| {
            let keep = now.duration_since(entry.last_touched) < max_age;
            if !keep {
                debug!(%object, buffered = entry.updates.len(), "aged out orphaned updates");
            }
            keep
        });
        before - self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Number of objects with buffered deltas.
    pub fn len(&self) -> usize {
        self.orphans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prox_types::{Sequenced, Vec3};

    fn location_delta(seqno: u64) -> FieldUpdates {
        FieldUpdates {
            location: Some(Sequenced::new(Vec3::new(seqno as f64, 0.0, 0.0), seqno)),
            ..Default::default()
        }
    }

    #[test]
    fn take_returns_deltas_in_arrival_order_and_clears() {
        let mut orphans = OrphanedUpdateManager::new();
        let object = ObjectId::new();
        let now = Instant::now();
        orphans.add(object, location_delta(2), now);
        orphans.add(object, location_delta(1), now);

        let taken = orphans.take(object);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].location.unwrap().seqno, 2);
        assert_eq!(taken[1].location.unwrap().seqno, 1);
        assert!(orphans.is_empty());
        assert!(orphans.take(object).is_empty());
    }

    #[test]
    fn empty_deltas_are_not_buffered() {
        let mut orphans = OrphanedUpdateManager::new();
        orphans.add(ObjectId::new(), FieldUpdates::default(), Instant::now());
        assert!(orphans.is_empty());
    }

    #[test]
    fn cleanup_ages_out_stale_entries_only() {
        let mut orphans = OrphanedUpdateManager::new();
        let stale = ObjectId::new();
        let fresh = ObjectId::new();
        let start = Instant::now();
        orphans.add(stale, location_delta(1), start);
        orphans.add(fresh, location_delta(1), start + Duration::from_secs(50));

        let removed = orphans.cleanup(Duration::from_secs(60), start + Duration::from_secs(70));
        assert_eq!(removed, 1);
        assert_eq!(orphans.len(), 1);
        assert!(!orphans.take(fresh).is_empty());
    }
}

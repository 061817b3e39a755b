//! # Embedded Brute-Force Solid-Angle Engine
//!
//! A reference [`SpatialQueryEngine`] that re-evaluates every query against
//! the full cache contents on each tick and diffs the result sets. Suitable
//! for the replica sizes an object host actually sees (the cut keeps them
//! small); hosts indexing large replicas should supply a tree-backed engine.
//!
//! Removals carry the finality the cache recorded for them: an object the
//! server destroyed leaves query results as permanent, while cut movement
//! and threshold crossings stay transient.

use super::{AggregateListener, QueryEvent, QueryId, QueryParams, SpatialQueryEngine};
use crate::cache::PropertyCache;
use prox_types::{ObjectId, SolidAngle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct QueryRec {
    params: QueryParams,
    results: HashSet<ObjectId>,
    events: VecDeque<QueryEvent>,
}

/// Brute-force result-set-diffing engine over one property cache.
pub struct BasicSolidAngleEngine {
    cache: Option<Arc<PropertyCache>>,
    /// Unused by the brute-force strategy; kept so tree-backed forks of this
    /// engine can gate re-evaluation on it.
    #[allow(dead_code)]
    static_only: bool,
    queries: HashMap<QueryId, QueryRec>,
    next_id: u64,
    aggregate: Option<Arc<dyn AggregateListener>>,
    observer_counts: HashMap<ObjectId, u32>,
}

impl BasicSolidAngleEngine {
    pub fn new() -> Self {
        Self {
            cache: None,
            static_only: false,
            queries: HashMap::new(),
            next_id: 1,
            aggregate: None,
            observer_counts: HashMap::new(),
        }
    }

    /// Computes the current result set for one query: every live object whose
    /// apparent solid angle meets the threshold, capped to the largest
    /// angles when `max_results` is set.
    fn evaluate(cache: &PropertyCache, params: &QueryParams) -> HashSet<ObjectId> {
        let mut candidates: Vec<(ObjectId, f64)> = Vec::new();
        for object in cache.live_objects() {
            if !cache.start_simple_tracking(object) {
                continue; // removed between listing and read
            }
            let location = cache.location(object);
            let bounds = cache.bounds(object);
            cache.stop_simple_tracking(object);
            let (location, bounds) = match (location, bounds) {
                (Some(l), Some(b)) => (l.value, b.value),
                _ => continue,
            };

            let center = prox_types::Vec3::new(
                location.x + bounds.center.x,
                location.y + bounds.center.y,
                location.z + bounds.center.z,
            );
            // The querier's own extent and region shrink the effective
            // distance; a query is satisfied from its closest surface point.
            let slack = params.region.radius + params.max_size;
            let distance = (params.position.distance(center) - slack).max(0.0);
            let apparent = SolidAngle::from_radius_and_distance(bounds.radius.max(1e-9), distance);
            if apparent.0 >= params.angle.0 {
                candidates.push((object, apparent.0));
            }
        }

        if params.max_results > 0 && candidates.len() > params.max_results as usize {
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            candidates.truncate(params.max_results as usize);
        }
        candidates.into_iter().map(|(object, _)| object).collect()
    }

    fn bump_observers(&mut self, object: ObjectId, entered: bool) {
        let count = self.observer_counts.entry(object).or_insert(0);
        if entered {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
        }
        let count = *count;
        if count == 0 {
            self.observer_counts.remove(&object);
        }
        if let Some(listener) = self.aggregate.clone() {
            listener.aggregate_observed(object, count);
        }
    }
}

impl Default for BasicSolidAngleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialQueryEngine for BasicSolidAngleEngine {
    fn initialize(&mut self, cache: Arc<PropertyCache>, static_only: bool) {
        self.cache = Some(cache);
        // Brute force re-evaluates regardless; the flag is kept for parity
        // with tree-backed implementations.
        self.static_only = static_only;
    }

    fn set_aggregate_listener(&mut self, listener: Arc<dyn AggregateListener>) {
        self.aggregate = Some(listener);
    }

    fn register_query(&mut self, params: QueryParams) -> QueryId {
        let id = QueryId(self.next_id);
        self.next_id += 1;
        self.queries.insert(
            id,
            QueryRec { params, results: HashSet::new(), events: VecDeque::new() },
        );
        trace!(%id, "registered solid-angle query");
        id
    }

    fn update_query(&mut self, id: QueryId, params: QueryParams) -> bool {
        match self.queries.get_mut(&id) {
            Some(rec) => {
                rec.params = params;
                true
            }
            None => false,
        }
    }

    fn remove_query(&mut self, id: QueryId) -> bool {
        match self.queries.remove(&id) {
            Some(rec) => {
                for object in rec.results {
                    self.bump_observers(object, false);
                }
                true
            }
            None => false,
        }
    }

    fn pop_events(&mut self, id: QueryId, limit: usize) -> Vec<QueryEvent> {
        let rec = match self.queries.get_mut(&id) {
            Some(rec) => rec,
            None => return Vec::new(),
        };
        let take = rec.events.len().min(limit);
        rec.events.drain(..take).collect()
    }

    fn tick(&mut self, _now: Instant) -> Vec<QueryId> {
        let cache = match self.cache.clone() {
            Some(cache) => cache,
            None => return Vec::new(),
        };

        let ids: Vec<QueryId> = self.queries.keys().copied().collect();
        for id in ids {
            let (new_results, old_results) = match self.queries.get(&id) {
                Some(rec) => (Self::evaluate(&cache, &rec.params), rec.results.clone()),
                None => continue,
            };

            for object in new_results.difference(&old_results) {
                self.bump_observers(*object, true);
            }
            for object in old_results.difference(&new_results) {
                self.bump_observers(*object, false);
            }

            if let Some(rec) = self.queries.get_mut(&id) {
                for object in new_results.difference(&old_results) {
                    rec.events.push_back(QueryEvent::Added { object: *object });
                }
                for object in old_results.difference(&new_results) {
                    rec.events.push_back(QueryEvent::Removed {
                        object: *object,
                        permanent: cache.was_destroyed(*object),
                    });
                }
                rec.results = new_results;
            }
        }

        self.queries
            .iter()
            .filter(|(_, rec)| !rec.events.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }
}

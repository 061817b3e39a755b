//! # Local Query Execution
//!
//! Per remote space-node, owns one embedded spatial-query engine per
//! replicated sub-tree, registers every object query against each of them,
//! converts engine events into outbound proximity-result batches, and feeds
//! node-observation transitions back so the replicated cut can be refined or
//! coarsened.
//!
//! All methods run inside the session's replication context; results cross
//! back to the main context as [`HostEvent`] values on an unbounded channel.

use crate::cache::{PropertyCache, PropertyUpdateListener};
use crate::config::ReplicaConfig;
use crate::engine::{AggregateListener, EngineFactory, QueryEvent, QueryId, QueryParams};
use crate::wire::{
    FieldUpdates, LocationResult, ProximityAddition, ProximityRemoval, ProximityResult,
};
use prox_types::{
    BoundingSphere, ObjectId, ProxIndexId, Quaternion, Sequenced, SolidAngle, SpaceNodeId, Vec3,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Sentinel for [`LocalQueryProcessor::update_query`]: leave the current
/// result-count cap unchanged (the call is a position refresh).
pub const NO_UPDATE_MAX_RESULTS: u32 = u32::MAX;

/// A finished result crossing from a replication context back to the main
/// context, addressed to the querying object.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Result-set changes for one query tick.
    Proximity { querier: ObjectId, result: ProximityResult },
    /// A property delta for an object the querier's result set includes.
    Location { querier: ObjectId, result: LocationResult },
}

/// Cut-management feedback produced by draining observation transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutFeedback {
    /// A replicated node gained its first observer; the cut should refine.
    Observed { index: ProxIndexId, node: ObjectId },
    /// A replicated node lost its last observer; coarsen candidate.
    Unobserved { index: ProxIndexId, node: ObjectId },
}

/// Summary of one replicated sub-tree for the operational command surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexSummary {
    pub index: ProxIndexId,
    pub live_objects: usize,
    pub dynamic: bool,
    pub source_server: Option<u32>,
}

/// Counters in the style of the rest of the host's stats surfaces.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct QuerierStats {
    pub additions_sent: u64,
    pub removals_sent: u64,
    pub queries_registered: u64,
    pub queries_removed: u64,
}

/// Tags engine observation callbacks with the owning sub-tree and parks them
/// until the processor's tick drains them. Engines call this from inside
/// their own tick, so the relay must not reach back into the processor.
struct AggregateRelay {
    index: ProxIndexId,
    events: Arc<Mutex<Vec<(ProxIndexId, ObjectId, u32)>>>,
}

impl AggregateListener for AggregateRelay {
    fn aggregate_observed(&self, node: ObjectId, observer_count: u32) {
        self.events.lock().unwrap().push((self.index, node, observer_count));
    }
}

/// Cache listener that fans applied property updates out to every querier
/// currently subscribed to the updated object. Runs on the cache's delivery
/// context; only values are moved across.
struct SubscriptionForwarder {
    subscribers: Arc<Mutex<HashMap<ObjectId, HashSet<ObjectId>>>>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl SubscriptionForwarder {
    fn forward(&self, object: ObjectId, fields: FieldUpdates) {
        let targets: Vec<ObjectId> = match self.subscribers.lock().unwrap().get(&object) {
            Some(queriers) => queriers.iter().copied().collect(),
            None => return,
        };
        for querier in targets {
            let event = HostEvent::Location {
                querier,
                result: LocationResult { object, fields: fields.clone() },
            };
            if self.events.send(event).is_err() {
                trace!(%object, "host event channel closed, dropping location result");
                return;
            }
        }
    }
}

impl PropertyUpdateListener for SubscriptionForwarder {
    fn location_updated(&self, object: ObjectId, value: Sequenced<Vec3>) {
        self.forward(object, FieldUpdates { location: Some(value), ..Default::default() });
    }
    fn orientation_updated(&self, object: ObjectId, value: Sequenced<Quaternion>) {
        self.forward(object, FieldUpdates { orientation: Some(value), ..Default::default() });
    }
    fn bounds_updated(&self, object: ObjectId, value: Sequenced<BoundingSphere>) {
        self.forward(object, FieldUpdates { bounds: Some(value), ..Default::default() });
    }
    fn mesh_updated(&self, object: ObjectId, value: Sequenced<String>) {
        self.forward(object, FieldUpdates { mesh: Some(value), ..Default::default() });
    }
    fn physics_updated(&self, object: ObjectId, value: Sequenced<String>) {
        self.forward(object, FieldUpdates { physics: Some(value), ..Default::default() });
    }
    fn parent_updated(&self, object: ObjectId, value: Sequenced<ObjectId>) {
        self.forward(object, FieldUpdates { parent: Some(value), ..Default::default() });
    }
    fn epoch_updated(&self, object: ObjectId, value: Sequenced<u64>) {
        self.forward(object, FieldUpdates { epoch: Some(value), ..Default::default() });
    }
}

struct IndexState {
    engine: Box<dyn crate::engine::SpatialQueryEngine>,
    cache: Arc<PropertyCache>,
    source_server: Option<u32>,
    dynamic: bool,
    /// Engine handle back to the owning querier object.
    owners: HashMap<QueryId, ObjectId>,
}

struct QueryState {
    location: Vec3,
    bounds: BoundingSphere,
    angle: SolidAngle,
    max_results: u32,
    handles: HashMap<ProxIndexId, QueryId>,
}

impl QueryState {
    fn params(&self) -> QueryParams {
        QueryParams {
            position: self.location,
            region: self.bounds,
            max_size: 0.0,
            angle: self.angle,
            max_results: self.max_results,
        }
    }
}

/// Query execution for one `SpaceNodeId`: all replicated sub-trees of that
/// node and all local object queries against them.
pub struct LocalQueryProcessor {
    node: SpaceNodeId,
    config: ReplicaConfig,
    engine_factory: EngineFactory,
    indices: HashMap<ProxIndexId, IndexState>,
    queries: HashMap<ObjectId, QueryState>,
    /// observed object -> queriers subscribed to its updates
    subscribers: Arc<Mutex<HashMap<ObjectId, HashSet<ObjectId>>>>,
    aggregate_events: Arc<Mutex<Vec<(ProxIndexId, ObjectId, u32)>>>,
    observed: HashSet<(ProxIndexId, ObjectId)>,
    events: mpsc::UnboundedSender<HostEvent>,
    stats: QuerierStats,
}

impl LocalQueryProcessor {
    pub fn new(
        node: SpaceNodeId,
        config: ReplicaConfig,
        engine_factory: EngineFactory,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            node,
            config,
            engine_factory,
            indices: HashMap::new(),
            queries: HashMap::new(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            aggregate_events: Arc::new(Mutex::new(Vec::new())),
            observed: HashSet::new(),
            events,
            stats: QuerierStats::default(),
        }
    }

    /// A new replicated sub-tree appeared: allocate an engine bound to its
    /// cache and register every active query against it.
    ///
    /// Queries are registered at the root of every sub-tree rather than only
    /// against sub-trees whose bounding region could contain results. This is
    /// a known shortcut, kept deliberately; pruning registration is future
    /// work.
    pub fn index_created(
        &mut self,
        index: ProxIndexId,
        cache: Arc<PropertyCache>,
        source_server: Option<u32>,
        dynamic: bool,
    ) {
        if self.indices.contains_key(&index) {
            warn!(node = %self.node, %index, "duplicate index creation ignored");
            return;
        }

        let mut engine = (self.engine_factory)();
        engine.initialize(cache.clone(), !dynamic);
        engine.set_aggregate_listener(Arc::new(AggregateRelay {
            index,
            events: self.aggregate_events.clone(),
        }));
        cache.add_listener(Arc::new(SubscriptionForwarder {
            subscribers: self.subscribers.clone(),
            events: self.events.clone(),
        }));

        let mut owners = HashMap::new();
        for (object, query) in self.queries.iter_mut() {
            let id = engine.register_query(query.params());
            query.handles.insert(index, id);
            owners.insert(id, *object);
        }

        info!(
            node = %self.node,
            %index,
            dynamic,
            queries = owners.len(),
            "replicated index created"
        );
        self.indices.insert(
            index,
            IndexState { engine, cache, source_server, dynamic, owners },
        );
    }

    /// A replicated sub-tree went away. The engine runs one final pass over
    /// the drained cache so every querier sees its remaining result members
    /// leave, then it is dropped along with the queries registered on it.
    pub fn index_removed(&mut self, index: ProxIndexId) -> bool {
        let mut state = match self.indices.remove(&index) {
            Some(state) => state,
            None => {
                debug!(node = %self.node, %index, "removal of unknown index ignored");
                return false;
            }
        };

        let limit = self.config.max_events_per_query_tick;
        let mut batches: HashMap<ObjectId, ProximityResult> = HashMap::new();
        for id in state.engine.tick(Instant::now()) {
            let querier = match state.owners.get(&id) {
                Some(querier) => *querier,
                None => continue,
            };
            for event in state.engine.pop_events(id, limit) {
                if let QueryEvent::Removed { object, permanent } = event {
                    batches
                        .entry(querier)
                        .or_default()
                        .removals
                        .push(ProximityRemoval { object, permanent });
                    let mut subscribers = self.subscribers.lock().unwrap();
                    if let Some(queriers) = subscribers.get_mut(&object) {
                        queriers.remove(&querier);
                        if queriers.is_empty() {
                            subscribers.remove(&object);
                        }
                    }
                    self.stats.removals_sent += 1;
                }
            }
        }
        for (querier, result) in batches {
            if self.events.send(HostEvent::Proximity { querier, result }).is_err() {
                trace!(node = %self.node, "host event channel closed, dropping proximity result");
            }
        }

        for query in self.queries.values_mut() {
            query.handles.remove(&index);
        }
        self.observed.retain(|(i, _)| *i != index);
        info!(node = %self.node, %index, "replicated index removed");
        true
    }

    /// Creates or refreshes the query owned by `object`.
    ///
    /// Position and bounds always apply. [`SolidAngle::NO_UPDATE`] and
    /// [`NO_UPDATE_MAX_RESULTS`] mark the call as a position refresh: the
    /// stored constraints are kept, and if no query exists yet the call is a
    /// no-op because there is nothing to refresh.
    pub fn update_query(
        &mut self,
        object: ObjectId,
        location: Vec3,
        bounds: BoundingSphere,
        angle: SolidAngle,
        max_results: u32,
    ) {
        let refresh_only = angle.is_no_update() && max_results == NO_UPDATE_MAX_RESULTS;
        let query = match self.queries.entry(object) {
            Entry::Vacant(vacant) => {
                if refresh_only {
                    debug!(node = %self.node, %object, "position refresh without a query ignored");
                    return;
                }
                self.stats.queries_registered += 1;
                vacant.insert(QueryState {
                    location,
                    bounds,
                    angle: if angle.is_no_update() { SolidAngle::MIN } else { angle },
                    max_results: if max_results == NO_UPDATE_MAX_RESULTS { 0 } else { max_results },
                    handles: HashMap::new(),
                })
            }
            Entry::Occupied(occupied) => {
                let query = occupied.into_mut();
                query.location = location;
                query.bounds = bounds;
                if !angle.is_no_update() {
                    query.angle = angle;
                }
                if max_results != NO_UPDATE_MAX_RESULTS {
                    query.max_results = max_results;
                }
                query
            }
        };

        let params = query.params();
        for (index, state) in self.indices.iter_mut() {
            match query.handles.get(index) {
                Some(id) => {
                    state.engine.update_query(*id, params);
                }
                None => {
                    let id = state.engine.register_query(params);
                    query.handles.insert(*index, id);
                    state.owners.insert(id, object);
                }
            }
        }
    }

    /// Destroys the query owned by `object` and drops its subscriptions.
    pub fn remove_query(&mut self, object: ObjectId) -> bool {
        let query = match self.queries.remove(&object) {
            Some(query) => query,
            None => {
                debug_assert!(false, "removing a query that was never registered");
                warn!(node = %self.node, %object, "removal of unregistered query ignored");
                return false;
            }
        };
        for (index, id) in query.handles {
            if let Some(state) = self.indices.get_mut(&index) {
                state.engine.remove_query(id);
                state.owners.remove(&id);
            }
        }
        {
            let mut subscribers = self.subscribers.lock().unwrap();
            for queriers in subscribers.values_mut() {
                queriers.remove(&object);
            }
            subscribers.retain(|_, queriers| !queriers.is_empty());
        }
        self.stats.queries_removed += 1;
        debug!(node = %self.node, %object, "query removed");
        true
    }

    /// Ticks every engine, batches its events into per-querier proximity
    /// results, and returns the cut feedback produced by observation
    /// transitions. Runs inside the replication context only.
    pub fn tick(&mut self, now: Instant) -> Vec<CutFeedback> {
        let limit = self.config.max_events_per_query_tick;
        let mut batches: HashMap<ObjectId, ProximityResult> = HashMap::new();

        for state in self.indices.values_mut() {
            let ready = state.engine.tick(now);
            for id in ready {
                let querier = match state.owners.get(&id) {
                    Some(querier) => *querier,
                    None => continue, // query torn down after the engine queued events
                };
                for event in state.engine.pop_events(id, limit) {
                    match event {
                        QueryEvent::Added { object } => {
                            if !state.cache.start_simple_tracking(object) {
                                // Disappeared between evaluation and drain; a
                                // removal event will follow.
                                continue;
                            }
                            let snap = state.cache.snapshot(object);
                            state.cache.stop_simple_tracking(object);
                            let snap = match snap {
                                Some(snap) => snap,
                                None => continue,
                            };
                            batches.entry(querier).or_default().additions.push(
                                ProximityAddition {
                                    object,
                                    location: snap.location,
                                    orientation: snap.orientation,
                                    bounds: snap.bounds,
                                    mesh: snap.mesh,
                                    physics: snap.physics,
                                },
                            );
                            self.subscribers
                                .lock()
                                .unwrap()
                                .entry(object)
                                .or_default()
                                .insert(querier);
                            self.stats.additions_sent += 1;
                        }
                        QueryEvent::Removed { object, permanent } => {
                            batches
                                .entry(querier)
                                .or_default()
                                .removals
                                .push(ProximityRemoval { object, permanent });
                            let mut subscribers = self.subscribers.lock().unwrap();
                            if let Some(queriers) = subscribers.get_mut(&object) {
                                queriers.remove(&querier);
                                if queriers.is_empty() {
                                    subscribers.remove(&object);
                                }
                            }
                            self.stats.removals_sent += 1;
                        }
                    }
                }
            }
        }

        for (querier, result) in batches {
            if result.is_empty() {
                continue;
            }
            if self.events.send(HostEvent::Proximity { querier, result }).is_err() {
                trace!(node = %self.node, "host event channel closed, dropping proximity result");
            }
        }

        self.drain_cut_feedback()
    }

    /// Converts raw observation-count reports into 0→1 / →0 transitions.
    fn drain_cut_feedback(&mut self) -> Vec<CutFeedback> {
        let raw: Vec<(ProxIndexId, ObjectId, u32)> =
            self.aggregate_events.lock().unwrap().drain(..).collect();
        let mut feedback = Vec::new();
        for (index, node, count) in raw {
            if !self.indices.contains_key(&index) {
                continue; // index torn down after the engine reported
            }
            if count > 0 {
                if self.observed.insert((index, node)) {
                    feedback.push(CutFeedback::Observed { index, node });
                }
            } else if self.observed.remove(&(index, node)) {
                feedback.push(CutFeedback::Unobserved { index, node });
            }
        }
        feedback
    }

    /// Tears down every sub-tree and query.
    pub fn stop(&mut self) {
        let indices = self.indices.len();
        let queries = self.queries.len();
        self.indices.clear();
        self.queries.clear();
        self.subscribers.lock().unwrap().clear();
        self.observed.clear();
        info!(node = %self.node, indices, queries, "query processor stopped");
    }

    pub fn active_query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn query_owners(&self) -> Vec<ObjectId> {
        self.queries.keys().copied().collect()
    }

    pub fn index_summaries(&self) -> Vec<IndexSummary> {
        let mut summaries: Vec<IndexSummary> = self
            .indices
            .iter()
            .map(|(index, state)| IndexSummary {
                index: *index,
                live_objects: state.cache.live_objects().len(),
                dynamic: state.dynamic,
                source_server: state.source_server,
            })
            .collect();
        summaries.sort_by_key(|s| s.index);
        summaries
    }

    pub fn stats(&self) -> &QuerierStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::snapshot;
    use crate::engine::basic_engine_factory;
    use prox_types::{NodeId, SpaceId};

    fn test_node() -> SpaceNodeId {
        SpaceNodeId::new(SpaceId::new(), NodeId::new())
    }

    fn processor() -> (LocalQueryProcessor, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let processor = LocalQueryProcessor::new(
            test_node(),
            ReplicaConfig::default(),
            basic_engine_factory(),
            tx,
        );
        (processor, rx)
    }

    fn place(cache: &PropertyCache, object: ObjectId, position: Vec3, radius: f64) {
        let mut snap = snapshot(object, 1);
        snap.location = Sequenced::new(position, 1);
        snap.bounds = Sequenced::new(BoundingSphere::new(Vec3::ZERO, radius), 1);
        cache.object_added(snap);
        cache.deliver_pending();
    }

    #[test]
    fn existing_queries_register_against_new_indices_exactly_once() {
        let (mut processor, _rx) = processor();
        let querier = ObjectId::new();
        processor.update_query(querier, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.01), 0);

        let t0 = PropertyCache::new("t0");
        let t1 = PropertyCache::new("t1");
        processor.index_created(ProxIndexId(0), t0, Some(1), false);
        processor.index_created(ProxIndexId(1), t1, Some(1), true);

        let query = processor.queries.get(&querier).unwrap();
        assert_eq!(query.handles.len(), 2);
        assert!(query.handles.contains_key(&ProxIndexId(0)));
        assert!(query.handles.contains_key(&ProxIndexId(1)));

        // A later parameter update touches both registrations, adds none.
        processor.update_query(querier, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.02), 5);
        assert_eq!(processor.queries.get(&querier).unwrap().handles.len(), 2);
    }

    #[test]
    fn additions_carry_full_snapshots_and_subscribe_the_querier() {
        let (mut processor, mut rx) = processor();
        let cache = PropertyCache::new("t0");
        processor.index_created(ProxIndexId(0), cache.clone(), None, false);

        let querier = ObjectId::new();
        processor.update_query(querier, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.01), 0);

        let observed = ObjectId::new();
        place(&cache, observed, Vec3::new(5.0, 0.0, 0.0), 1.0);

        processor.tick(Instant::now());
        let event = rx.try_recv().expect("one proximity batch");
        match event {
            HostEvent::Proximity { querier: q, result } => {
                assert_eq!(q, querier);
                assert_eq!(result.additions.len(), 1);
                assert_eq!(result.additions[0].object, observed);
                assert_eq!(result.additions[0].location.seqno, 1);
                assert!(result.removals.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Subscribed: a later location update is forwarded to the querier.
        cache.location_updated(observed, Sequenced::new(Vec3::new(6.0, 0.0, 0.0), 2));
        cache.deliver_pending();
        match rx.try_recv().expect("location result") {
            HostEvent::Location { querier: q, result } => {
                assert_eq!(q, querier);
                assert_eq!(result.object, observed);
                assert_eq!(result.fields.location.unwrap().seqno, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn leaving_the_result_set_emits_transient_removal_and_unsubscribes() {
        let (mut processor, mut rx) = processor();
        let cache = PropertyCache::new("t0");
        processor.index_created(ProxIndexId(0), cache.clone(), None, true);

        let querier = ObjectId::new();
        processor.update_query(querier, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.01), 0);
        let observed = ObjectId::new();
        place(&cache, observed, Vec3::new(5.0, 0.0, 0.0), 1.0);
        processor.tick(Instant::now());
        let _ = rx.try_recv().expect("addition batch");

        cache.location_updated(observed, Sequenced::new(Vec3::new(5000.0, 0.0, 0.0), 2));
        cache.deliver_pending();
        let _ = rx.try_recv().expect("forwarded location update");

        processor.tick(Instant::now());
        match rx.try_recv().expect("removal batch") {
            HostEvent::Proximity { querier: q, result } => {
                assert_eq!(q, querier);
                assert_eq!(
                    result.removals,
                    vec![ProximityRemoval { object: observed, permanent: false }]
                );
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Unsubscribed: further updates are not forwarded.
        cache.location_updated(observed, Sequenced::new(Vec3::new(5001.0, 0.0, 0.0), 3));
        cache.deliver_pending();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn refresh_without_existing_query_is_a_noop() {
        let (mut processor, _rx) = processor();
        processor.index_created(ProxIndexId(0), PropertyCache::new("t0"), None, false);
        processor.update_query(
            ObjectId::new(),
            Vec3::ZERO,
            BoundingSphere::point(),
            SolidAngle::NO_UPDATE,
            NO_UPDATE_MAX_RESULTS,
        );
        assert_eq!(processor.active_query_count(), 0);
    }

    #[test]
    fn refresh_keeps_constraints_but_moves_position() {
        let (mut processor, _rx) = processor();
        let querier = ObjectId::new();
        processor.update_query(querier, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.5), 7);
        processor.update_query(
            querier,
            Vec3::new(10.0, 0.0, 0.0),
            BoundingSphere::point(),
            SolidAngle::NO_UPDATE,
            NO_UPDATE_MAX_RESULTS,
        );
        let query = processor.queries.get(&querier).unwrap();
        assert_eq!(query.location, Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(query.angle, SolidAngle(0.5));
        assert_eq!(query.max_results, 7);
    }

    #[test]
    fn cut_feedback_reports_only_transitions() {
        let (mut processor, _rx) = processor();
        let cache = PropertyCache::new("t0");
        processor.index_created(ProxIndexId(0), cache.clone(), None, false);

        let observed = ObjectId::new();
        place(&cache, observed, Vec3::new(5.0, 0.0, 0.0), 1.0);

        let first = ObjectId::new();
        processor.update_query(first, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.01), 0);
        let feedback = processor.tick(Instant::now());
        assert_eq!(
            feedback,
            vec![CutFeedback::Observed { index: ProxIndexId(0), node: observed }]
        );

        // Second observer: count goes 1→2, no new transition.
        let second = ObjectId::new();
        processor.update_query(second, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.01), 0);
        assert!(processor.tick(Instant::now()).is_empty());

        processor.remove_query(first);
        assert!(processor.tick(Instant::now()).is_empty());
        processor.remove_query(second);
        let feedback = processor.tick(Instant::now());
        assert_eq!(
            feedback,
            vec![CutFeedback::Unobserved { index: ProxIndexId(0), node: observed }]
        );
    }

    #[test]
    fn index_removal_flushes_remaining_result_members() {
        let (mut processor, mut rx) = processor();
        let cache = PropertyCache::new("t0");
        processor.index_created(ProxIndexId(0), cache.clone(), None, true);

        let querier = ObjectId::new();
        processor.update_query(querier, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.01), 0);
        let observed = ObjectId::new();
        place(&cache, observed, Vec3::new(5.0, 0.0, 0.0), 1.0);
        processor.tick(Instant::now());
        let _ = rx.try_recv().expect("addition batch");

        // The object is destroyed and its sub-tree goes vacant: the removal
        // must still reach the querier, carrying the destruction.
        cache.object_removed(observed, true);
        cache.deliver_pending();
        assert!(processor.index_removed(ProxIndexId(0)));
        match rx.try_recv().expect("removal batch on tear-down") {
            HostEvent::Proximity { querier: q, result } => {
                assert_eq!(q, querier);
                assert_eq!(
                    result.removals,
                    vec![ProximityRemoval { object: observed, permanent: true }]
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn index_removal_invalidates_handles() {
        let (mut processor, _rx) = processor();
        let querier = ObjectId::new();
        processor.update_query(querier, Vec3::ZERO, BoundingSphere::point(), SolidAngle(0.01), 0);
        processor.index_created(ProxIndexId(3), PropertyCache::new("t3"), None, false);
        assert!(processor.index_removed(ProxIndexId(3)));
        assert!(processor.queries.get(&querier).unwrap().handles.is_empty());
        assert!(!processor.index_removed(ProxIndexId(3)));
    }
}

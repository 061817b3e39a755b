//! # Spatial Query Engine Interface
//!
//! The actual solid-angle query evaluation is an external collaborator: the
//! local query processor drives it only through the traits defined here. One
//! engine instance is bound to one replicated sub-tree's property cache and
//! is ticked exclusively from that session's replication context.
//!
//! [`solid_angle`] provides an embedded brute-force implementation so the
//! crate is usable out of the box; hosts with a real spatial index plug in
//! their own [`SpatialQueryEngine`].

pub mod solid_angle;

use crate::cache::PropertyCache;
use prox_types::{BoundingSphere, ObjectId, SolidAngle, Vec3};
use std::sync::Arc;
use tokio::time::Instant;

/// Engine-local handle for one registered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query-{}", self.0)
    }
}

/// Parameters of one registered query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryParams {
    /// The querying object's position.
    pub position: Vec3,
    /// The querying object's own bounds (world-space center).
    pub region: BoundingSphere,
    /// Largest extent of the querying object, folded into distance terms.
    pub max_size: f64,
    /// Minimum apparent solid angle for inclusion.
    pub angle: SolidAngle,
    /// Result-count cap; `0` means unconstrained.
    pub max_results: u32,
}

/// A change to one query's result set, emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryEvent {
    /// `object` entered the result set.
    Added { object: ObjectId },
    /// `object` left the result set. `permanent` distinguishes destruction
    /// from cut movement or constraint changes.
    Removed { object: ObjectId, permanent: bool },
}

/// Callback for replicated-tree-node observation counts.
///
/// Fired whenever the number of queries whose result set includes `node`
/// changes. The consumer is responsible for reacting only to the 0→1 and →0
/// transitions.
pub trait AggregateListener: Send + Sync {
    fn aggregate_observed(&self, node: ObjectId, observer_count: u32);
}

/// The embedded per-sub-tree spatial query engine, driven from the owning
/// replication context only. Dropping the engine implicitly unsubscribes and
/// destroys every query registered with it.
pub trait SpatialQueryEngine: Send {
    /// Binds the engine to the sub-tree's property cache. `static_only`
    /// marks sub-trees whose objects never move, which lets implementations
    /// skip per-tick re-evaluation of unchanged queries.
    fn initialize(&mut self, cache: Arc<PropertyCache>, static_only: bool);

    /// Installs the observation-count callback.
    fn set_aggregate_listener(&mut self, listener: Arc<dyn AggregateListener>);

    /// Registers a new query and returns its engine-local handle.
    fn register_query(&mut self, params: QueryParams) -> QueryId;

    /// Replaces a query's parameters. Returns `false` for unknown handles.
    fn update_query(&mut self, id: QueryId, params: QueryParams) -> bool;

    /// Destroys a query. Returns `false` for unknown handles.
    fn remove_query(&mut self, id: QueryId) -> bool;

    /// Drains up to `limit` pending events for one query.
    fn pop_events(&mut self, id: QueryId, limit: usize) -> Vec<QueryEvent>;

    /// Advances the engine one evaluation step and returns the queries that
    /// now have pending events.
    fn tick(&mut self, now: Instant) -> Vec<QueryId>;
}

/// Constructor for engine instances, injected so tests and hosts can swap
/// implementations without touching the query processor.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn SpatialQueryEngine> + Send + Sync>;

/// Factory for the embedded brute-force engine.
pub fn basic_engine_factory() -> EngineFactory {
    Arc::new(|| Box::new(solid_angle::BasicSolidAngleEngine::new()) as Box<dyn SpatialQueryEngine>)
}

//! # Proximity Replica
//!
//! Object-host side of the replicated-cut proximity protocol for a
//! partitioned virtual world. Instead of forwarding every proximity query to
//! the space servers, the host requests a live partial replica (a "cut") of
//! each relevant server's spatial tree, keeps it synchronized through the
//! topology and property streams, and evaluates queries locally against the
//! replica.
//!
//! ## Architecture
//!
//! - [`session::ProximityOrchestrator`] is the main-context entry point: it
//!   tracks hosted objects' session state and routes stream bytes, queries
//!   and finished results.
//! - One replication context ([`runtime`]) runs per remote space-server
//!   node, single-threading that node's cut handler, caches and query
//!   engines. Contexts communicate only through one-way command messages.
//! - [`replication::ReplicatedCutHandler`] applies the topology ("prox") and
//!   property ("loc") streams and steers the cut with refine and coarsen
//!   control requests.
//! - [`cache::PropertyCache`] stores replicated state per sub-tree with
//!   per-field sequence versioning; [`orphans`] buffers property deltas that
//!   outran their topology additions.
//! - [`querier::LocalQueryProcessor`] drives one [`engine`] per sub-tree and
//!   turns engine events into per-querier result batches.
//!
//! ## Example
//!
//! ```no_run
//! use prox_replica::config::ReplicaConfig;
//! use prox_replica::engine::basic_engine_factory;
//! use prox_replica::session::ProximityOrchestrator;
//! # use prox_replica::runtime::ControlSink;
//! # use prox_replica::session::ResultSink;
//! # use prox_replica::wire::{LocationResult, ProximityResult};
//! # use prox_types::{ObjectId, SpaceNodeId};
//! # use std::sync::Arc;
//! # struct Transport;
//! # #[async_trait::async_trait]
//! # impl ControlSink for Transport {
//! #     async fn send_control(&self, _node: SpaceNodeId, _payload: Vec<u8>) {}
//! # }
//! # struct Host;
//! # #[async_trait::async_trait]
//! # impl ResultSink for Host {
//! #     async fn proximity_result(&self, _querier: ObjectId, _result: ProximityResult) {}
//! #     async fn location_result(&self, _querier: ObjectId, _result: LocationResult) {}
//! # }
//! # async fn demo() {
//! let orchestrator = ProximityOrchestrator::new(
//!     ReplicaConfig::default(),
//!     basic_engine_factory(),
//!     Arc::new(Transport),
//!     Arc::new(Host),
//! );
//! # let _ = orchestrator;
//! # }
//! ```

pub mod cache;
pub mod commands;
pub mod config;
pub mod engine;
pub mod orphans;
pub mod querier;
pub mod replication;
pub mod runtime;
pub mod session;
pub mod wire;

pub use cache::{ObjectSnapshot, PropertyCache, PropertyUpdateListener};
pub use commands::{AdminCommand, AdminSurface, CommandError};
pub use config::ReplicaConfig;
pub use engine::{basic_engine_factory, EngineFactory, SpatialQueryEngine};
pub use querier::{CutFeedback, HostEvent, NO_UPDATE_MAX_RESULTS};
pub use replication::{HandlerPhase, ReplicaEvent, ReplicatedCutHandler};
pub use runtime::{ControlSink, NodeCommand, NodeSessionHandle, NodeSnapshot};
pub use session::{ObjectPhase, ProximityOrchestrator, ResultSink, SessionError};
pub use wire::{
    ControlAction, FieldUpdates, LocationResult, PropertyUpdate, ProximityResult, QueryRequest,
    TopologyUpdate, WireError,
};

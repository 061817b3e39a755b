//! # Proximity Orchestrator
//!
//! Main-context facade of the object host's proximity service. It tracks the
//! session state of every locally hosted object, lazily spawns one
//! replication context per remote space-server node, routes inbound stream
//! bytes to the right context, and fans finished results back out to the
//! host through a [`ResultSink`].
//!
//! Everything here is non-blocking: calls into replication contexts are
//! one-way command sends, and result delivery runs on its own routing task.

use crate::config::ReplicaConfig;
use crate::engine::EngineFactory;
use crate::querier::{HostEvent, NO_UPDATE_MAX_RESULTS};
use crate::runtime::{spawn_node_session, ControlSink, NodeCommand, NodeSessionHandle};
use crate::wire::{LocationResult, ProximityResult, QueryRequest, WireError};
use async_trait::async_trait;
use dashmap::DashMap;
use prox_types::{BoundingSphere, ObjectId, SolidAngle, SpaceNodeId, Vec3};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("object {0} has no session")]
    UnknownObject(ObjectId),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Session state of one hosted object. Absence from the orchestrator's map
/// is the disconnected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ObjectPhase {
    /// Space session established; streams not yet attached.
    SessionEstablished,
    /// Both the topology and property streams are attached; queries may run.
    StreamReady,
}

/// Host-side consumer of finished results, invoked from the routing task.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn proximity_result(&self, querier: ObjectId, result: ProximityResult);
    async fn location_result(&self, querier: ObjectId, result: LocationResult);
}

struct ObjectState {
    node: SpaceNodeId,
    phase: ObjectPhase,
    location: Vec3,
    bounds: BoundingSphere,
    /// The object's current query constraints. Registered with the node's
    /// replication context only while the phase is [`ObjectPhase::StreamReady`];
    /// before that the query is parked here.
    query: Option<QueryRequest>,
}

/// The object host's proximity service entry point.
pub struct ProximityOrchestrator {
    config: ReplicaConfig,
    engine_factory: EngineFactory,
    control: Arc<dyn ControlSink>,
    objects: DashMap<ObjectId, ObjectState>,
    sessions: DashMap<SpaceNodeId, NodeSessionHandle>,
    results: mpsc::UnboundedSender<HostEvent>,
}

impl ProximityOrchestrator {
    /// Creates the orchestrator and spawns its result-routing task.
    pub fn new(
        config: ReplicaConfig,
        engine_factory: EngineFactory,
        control: Arc<dyn ControlSink>,
        sink: Arc<dyn ResultSink>,
    ) -> Arc<Self> {
        let (results, mut rx) = mpsc::unbounded_channel::<HostEvent>();
        let orchestrator = Arc::new(Self {
            config,
            engine_factory,
            control,
            objects: DashMap::new(),
            sessions: DashMap::new(),
            results,
        });

        // The routing task holds only a weak reference so dropping the last
        // orchestrator handle ends it with the channel.
        let weak = Arc::downgrade(&orchestrator);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let querier = match &event {
                    HostEvent::Proximity { querier, .. } | HostEvent::Location { querier, .. } => {
                        *querier
                    }
                };
                // Results that outran a disconnect have no recipient.
                match weak.upgrade() {
                    Some(orchestrator) if !orchestrator.objects.contains_key(&querier) => {
                        debug!(%querier, "result for disconnected object dropped");
                        continue;
                    }
                    None => break,
                    _ => {}
                }
                match event {
                    HostEvent::Proximity { querier, result } => {
                        sink.proximity_result(querier, result).await;
                    }
                    HostEvent::Location { querier, result } => {
                        sink.location_result(querier, result).await;
                    }
                }
            }
        });
        orchestrator
    }

    // ------------------------------------------------------------------
    // Object session lifecycle
    // ------------------------------------------------------------------

    /// An object's space session came up on `node`. Spawns the node's
    /// replication context if this is the first object to touch it.
    ///
    /// Calling this for an object with a live session is a migration: the
    /// object moved to a different space-server node. Its query is pulled
    /// from the old node's context, the stored constraints survive, and the
    /// query re-registers when [`ProximityOrchestrator::streams_ready`]
    /// arrives for the new node.
    pub fn session_established(
        &self,
        object: ObjectId,
        node: SpaceNodeId,
        location: Vec3,
        bounds: BoundingSphere,
    ) -> Result<(), SessionError> {
        if let Some(mut state) = self.objects.get_mut(&object) {
            let old_node = state.node;
            let registered = state.query.is_some() && state.phase == ObjectPhase::StreamReady;
            state.node = node;
            state.phase = ObjectPhase::SessionEstablished;
            state.location = location;
            state.bounds = bounds;
            drop(state);
            if old_node != node {
                if registered {
                    self.send_to_node(old_node, NodeCommand::RemoveQuery { object });
                }
                self.release_node_if_unused(old_node);
                self.ensure_session(node);
            }
            info!(%object, from = %old_node, to = %node, "object session migrated");
            return Ok(());
        }

        self.ensure_session(node);
        self.objects.insert(
            object,
            ObjectState {
                node,
                phase: ObjectPhase::SessionEstablished,
                location,
                bounds,
                query: None,
            },
        );
        debug!(%object, %node, "object session established");
        Ok(())
    }

    /// The object's topology and property streams are both attached. A query
    /// stored while the streams were still attaching registers now.
    pub fn streams_ready(&self, object: ObjectId) -> Result<(), SessionError> {
        let mut state = self
            .objects
            .get_mut(&object)
            .ok_or(SessionError::UnknownObject(object))?;
        state.phase = ObjectPhase::StreamReady;
        debug!(%object, "object streams ready");
        if let Some(query) = state.query {
            let command = NodeCommand::UpdateQuery {
                object,
                location: state.location,
                bounds: state.bounds,
                angle: query.solid_angle(),
                max_results: query.result_cap(),
            };
            let node = state.node;
            drop(state);
            self.send_to_node(node, command);
        }
        Ok(())
    }

    /// The object disconnected. Cancels its query and tears down the node's
    /// replication context if no other object still references it.
    pub fn disconnected(&self, object: ObjectId) {
        let state = match self.objects.remove(&object) {
            Some((_, state)) => state,
            None => return,
        };
        if state.query.is_some() && state.phase == ObjectPhase::StreamReady {
            self.send_to_node(state.node, NodeCommand::RemoveQuery { object });
        }
        self.release_node_if_unused(state.node);
    }

    // ------------------------------------------------------------------
    // Queries and movement
    // ------------------------------------------------------------------

    /// Applies a textual query request for `object`. An empty string cancels
    /// the query; anything else is parsed and creates or retunes it. Requests
    /// arriving before the object's streams are attached are stored and take
    /// effect at [`ProximityOrchestrator::streams_ready`].
    pub fn query_request(&self, object: ObjectId, request: &str) -> Result<(), SessionError> {
        let mut state = self
            .objects
            .get_mut(&object)
            .ok_or(SessionError::UnknownObject(object))?;

        if request.trim().is_empty() {
            let registered =
                state.query.take().is_some() && state.phase == ObjectPhase::StreamReady;
            if registered {
                let node = state.node;
                drop(state);
                self.send_to_node(node, NodeCommand::RemoveQuery { object });
            }
            return Ok(());
        }

        let parsed = QueryRequest::parse(request)?;
        state.query = Some(parsed);
        if state.phase != ObjectPhase::StreamReady {
            debug!(%object, "query stored until streams attach");
            return Ok(());
        }
        let command = NodeCommand::UpdateQuery {
            object,
            location: state.location,
            bounds: state.bounds,
            angle: parsed.solid_angle(),
            max_results: parsed.result_cap(),
        };
        let node = state.node;
        drop(state);
        self.send_to_node(node, command);
        Ok(())
    }

    /// Records the object's movement and, when it has an active query,
    /// refreshes the query position without touching its constraints.
    pub fn position_update(
        &self,
        object: ObjectId,
        location: Vec3,
        bounds: BoundingSphere,
    ) -> Result<(), SessionError> {
        let mut state = self
            .objects
            .get_mut(&object)
            .ok_or(SessionError::UnknownObject(object))?;
        state.location = location;
        state.bounds = bounds;
        if state.query.is_none() || state.phase != ObjectPhase::StreamReady {
            return Ok(());
        }
        let command = NodeCommand::UpdateQuery {
            object,
            location,
            bounds,
            angle: SolidAngle::NO_UPDATE,
            max_results: NO_UPDATE_MAX_RESULTS,
        };
        let node = state.node;
        drop(state);
        self.send_to_node(node, command);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound streams
    // ------------------------------------------------------------------

    /// Routes raw topology-stream bytes to `node`'s replication context.
    pub fn topology_message(&self, node: SpaceNodeId, payload: Vec<u8>) {
        self.send_to_node(node, NodeCommand::TopologyMessage(payload));
    }

    /// Routes raw property-stream bytes to `node`'s replication context.
    pub fn property_message(&self, node: SpaceNodeId, payload: Vec<u8>) {
        self.send_to_node(node, NodeCommand::PropertyMessage(payload));
    }

    // ------------------------------------------------------------------
    // Introspection and shutdown
    // ------------------------------------------------------------------

    pub fn object_phase(&self, object: ObjectId) -> Option<ObjectPhase> {
        self.objects.get(&object).map(|s| s.phase)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn session_handles(&self) -> Vec<NodeSessionHandle> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Stops every replication context. Objects are left in place; a host
    /// shutting down discards the orchestrator afterwards.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().shutdown();
        }
        self.sessions.clear();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_session(&self, node: SpaceNodeId) {
        self.sessions.entry(node).or_insert_with(|| {
            info!(%node, "starting replication context");
            spawn_node_session(
                node,
                self.config.clone(),
                self.engine_factory.clone(),
                self.control.clone(),
                self.results.clone(),
            )
        });
    }

    /// Stops `node`'s replication context when no hosted object references
    /// it anymore. Callers must not hold an `objects` guard.
    fn release_node_if_unused(&self, node: SpaceNodeId) {
        let node_still_used = self.objects.iter().any(|s| s.node == node);
        if !node_still_used {
            if let Some((_, handle)) = self.sessions.remove(&node) {
                info!(%node, "last object left, stopping replication context");
                handle.shutdown();
            }
        }
    }

    fn send_to_node(&self, node: SpaceNodeId, command: NodeCommand) {
        match self.sessions.get(&node) {
            Some(handle) => {
                if !handle.send(command) {
                    warn!(%node, "replication context exited unexpectedly");
                }
            }
            None => warn!(%node, "message for node without a replication context dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::basic_engine_factory;
    use crate::wire::{ControlAction, IndexProperties, ObjectAddition, ObjectKind, TopologyUpdate};
    use prox_types::{NodeId, ProxIndexId, Quaternion, Sequenced, SpaceId};
    use std::sync::Mutex;
    use std::time::Duration;

    struct NullSink(Mutex<Vec<ControlAction>>);

    #[async_trait]
    impl ControlSink for NullSink {
        async fn send_control(&self, _node: SpaceNodeId, payload: Vec<u8>) {
            self.0.lock().unwrap().push(serde_json::from_slice(&payload).unwrap());
        }
    }

    #[derive(Default)]
    struct RecordingResults {
        proximity: Mutex<Vec<(ObjectId, ProximityResult)>>,
        locations: Mutex<Vec<(ObjectId, LocationResult)>>,
    }

    #[async_trait]
    impl ResultSink for RecordingResults {
        async fn proximity_result(&self, querier: ObjectId, result: ProximityResult) {
            self.proximity.lock().unwrap().push((querier, result));
        }
        async fn location_result(&self, querier: ObjectId, result: LocationResult) {
            self.locations.lock().unwrap().push((querier, result));
        }
    }

    fn orchestrator() -> (Arc<ProximityOrchestrator>, Arc<NullSink>, Arc<RecordingResults>) {
        let control = Arc::new(NullSink(Mutex::new(Vec::new())));
        let sink = Arc::new(RecordingResults::default());
        let orchestrator = ProximityOrchestrator::new(
            ReplicaConfig::default(),
            basic_engine_factory(),
            control.clone(),
            sink.clone(),
        );
        (orchestrator, control, sink)
    }

    fn node() -> SpaceNodeId {
        SpaceNodeId::new(SpaceId::new(), NodeId::new())
    }

    fn topology_bytes(object: ObjectId, position: Vec3) -> Vec<u8> {
        TopologyUpdate {
            index: ProxIndexId(0),
            index_properties: Some(IndexProperties { source_server: None, dynamic: Some(true) }),
            additions: vec![ObjectAddition {
                object,
                parent: None,
                kind: ObjectKind::Object,
                location: Sequenced::new(position, 1),
                orientation: Sequenced::new(Quaternion::IDENTITY, 1),
                bounds: Sequenced::new(BoundingSphere::new(Vec3::ZERO, 1.0), 1),
                mesh: None,
                physics: None,
            }],
            removals: vec![],
        }
        .encode()
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn queries_before_stream_attach_are_parked_and_register_later() {
        let (orchestrator, control, _) = orchestrator();
        let object = ObjectId::new();

        assert!(matches!(
            orchestrator.query_request(object, "{}"),
            Err(SessionError::UnknownObject(_))
        ));

        orchestrator
            .session_established(object, node(), Vec3::ZERO, BoundingSphere::point())
            .unwrap();
        orchestrator.query_request(object, r#"{"angle": 0.01}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Parked: the query is stored but not registered, so the node's
        // replica has no consumer yet and no init goes out.
        assert!(control.0.lock().unwrap().is_empty());

        orchestrator.streams_ready(object).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(control.0.lock().unwrap().clone(), vec![ControlAction::Init]);
        assert_eq!(orchestrator.object_phase(object), Some(ObjectPhase::StreamReady));
    }

    #[tokio::test(start_paused = true)]
    async fn parked_queries_can_be_cancelled_before_registration() {
        let (orchestrator, control, _) = orchestrator();
        let object = ObjectId::new();
        orchestrator
            .session_established(object, node(), Vec3::ZERO, BoundingSphere::point())
            .unwrap();
        orchestrator.query_request(object, r#"{"angle": 0.01}"#).unwrap();
        orchestrator.query_request(object, "").unwrap();

        orchestrator.streams_ready(object).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(control.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn migration_rebinds_the_query_to_the_new_node() {
        let (orchestrator, control, _) = orchestrator();
        let object = ObjectId::new();
        let old_node = node();
        let new_node = node();
        orchestrator
            .session_established(object, old_node, Vec3::ZERO, BoundingSphere::point())
            .unwrap();
        orchestrator.streams_ready(object).unwrap();
        orchestrator.query_request(object, r#"{"angle": 0.01}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(control.0.lock().unwrap().clone(), vec![ControlAction::Init]);

        // The object crosses to another space-server node: the old context
        // loses its last consumer and shuts down.
        orchestrator
            .session_established(object, new_node, Vec3::new(1.0, 0.0, 0.0), BoundingSphere::point())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orchestrator.session_handles().len(), 1);
        assert!(control.0.lock().unwrap().contains(&ControlAction::Destroy));
        assert_eq!(orchestrator.object_phase(object), Some(ObjectPhase::SessionEstablished));

        // The stored query survives the move and re-registers once the new
        // node's streams attach.
        orchestrator.streams_ready(object).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let actions = control.0.lock().unwrap().clone();
        assert_eq!(
            actions.iter().filter(|a| matches!(a, ControlAction::Init)).count(),
            2
        );
    }

    #[tokio::test]
    async fn malformed_query_requests_fail_without_state_changes() {
        let (orchestrator, _, _) = orchestrator();
        let object = ObjectId::new();
        orchestrator
            .session_established(object, node(), Vec3::ZERO, BoundingSphere::point())
            .unwrap();
        orchestrator.streams_ready(object).unwrap();
        assert!(matches!(
            orchestrator.query_request(object, "angle=1"),
            Err(SessionError::Wire(_))
        ));
        // An empty request with no active query is a harmless no-op.
        orchestrator.query_request(object, "  ").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn results_route_back_to_the_querying_object() {
        let (orchestrator, _, results) = orchestrator();
        let object = ObjectId::new();
        let space_node = node();
        orchestrator
            .session_established(object, space_node, Vec3::ZERO, BoundingSphere::point())
            .unwrap();
        orchestrator.streams_ready(object).unwrap();
        orchestrator.query_request(object, r#"{"angle": 0.01}"#).unwrap();

        let observed = ObjectId::new();
        orchestrator.topology_message(space_node, topology_bytes(observed, Vec3::new(5.0, 0.0, 0.0)));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let proximity = results.proximity.lock().unwrap();
        assert_eq!(proximity.len(), 1);
        assert_eq!(proximity[0].0, object);
        assert_eq!(proximity[0].1.additions[0].object, observed);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_of_last_object_stops_the_node_context() {
        let (orchestrator, control, _) = orchestrator();
        let space_node = node();
        let first = ObjectId::new();
        let second = ObjectId::new();
        for object in [first, second] {
            orchestrator
                .session_established(object, space_node, Vec3::ZERO, BoundingSphere::point())
                .unwrap();
            orchestrator.streams_ready(object).unwrap();
            orchestrator.query_request(object, r#"{"angle": 0.01}"#).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(control.0.lock().unwrap().clone(), vec![ControlAction::Init]);

        orchestrator.disconnected(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orchestrator.session_handles().len(), 1);

        orchestrator.disconnected(second);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orchestrator.session_handles().is_empty());
        assert!(control
            .0
            .lock()
            .unwrap()
            .contains(&ControlAction::Destroy));
    }
}

//! # Per-Node Replication Context
//!
//! One [`NodeSession`] task exists per remote space-server node with live
//! local interest. The task single-threads everything for that node: the cut
//! handler, the query processor, the engine tick and coarsen timers. Other
//! contexts talk to it only through one-way [`NodeCommand`] messages, so no
//! lock is ever held across a context boundary.

use crate::config::ReplicaConfig;
use crate::engine::EngineFactory;
use crate::querier::{HostEvent, IndexSummary, LocalQueryProcessor, QuerierStats};
use crate::replication::{HandlerPhase, HandlerStats, ReplicaEvent, ReplicatedCutHandler};
use crate::wire::{PropertyUpdate, TopologyUpdate};
use async_trait::async_trait;
use prox_types::{BoundingSphere, ObjectId, SolidAngle, SpaceNodeId, Vec3};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outbound half of a session's reliable control sub-channel. Implemented by
/// the host's transport layer; the session only hands it encoded payloads.
#[async_trait]
pub trait ControlSink: Send + Sync {
    async fn send_control(&self, node: SpaceNodeId, payload: Vec<u8>);
}

/// Commands accepted by a node session. All of them are one-way; the only
/// reply channel is the explicit oneshot inside [`NodeCommand::Snapshot`].
#[derive(Debug)]
pub enum NodeCommand {
    /// Raw bytes from the session's topology ("prox") stream.
    TopologyMessage(Vec<u8>),
    /// Raw bytes from the session's property ("loc") stream.
    PropertyMessage(Vec<u8>),
    /// Create or refresh the query owned by `object`.
    UpdateQuery {
        object: ObjectId,
        location: Vec3,
        bounds: BoundingSphere,
        angle: SolidAngle,
        max_results: u32,
    },
    /// Destroy the query owned by `object`.
    RemoveQuery { object: ObjectId },
    /// Report current session state for the operational command surface.
    Snapshot { reply: oneshot::Sender<NodeSnapshot> },
    /// Tear the session down, releasing the replica if one is live.
    Shutdown,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeSnapshot {
    pub node: SpaceNodeId,
    pub phase: HandlerPhase,
    pub consumers: usize,
    pub queriers: Vec<ObjectId>,
    pub indices: Vec<IndexSummary>,
    pub handler_stats: HandlerStats,
    pub querier_stats: QuerierStats,
}

/// Cheap cloneable handle for sending commands into a session.
#[derive(Clone)]
pub struct NodeSessionHandle {
    node: SpaceNodeId,
    commands: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeSessionHandle {
    pub fn node(&self) -> SpaceNodeId {
        self.node
    }

    /// Sends a command; returns `false` once the session has exited.
    pub fn send(&self, command: NodeCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn topology_message(&self, payload: Vec<u8>) -> bool {
        self.send(NodeCommand::TopologyMessage(payload))
    }

    pub fn property_message(&self, payload: Vec<u8>) -> bool {
        self.send(NodeCommand::PropertyMessage(payload))
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown);
    }

    /// Requests a state snapshot. `None` when the session has already exited.
    pub async fn snapshot(&self) -> Option<NodeSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(NodeCommand::Snapshot { reply }) {
            return None;
        }
        rx.await.ok()
    }
}

/// Spawns the replication context for one remote node and returns its handle.
/// Query results and forwarded property deltas arrive on `results`.
pub fn spawn_node_session(
    node: SpaceNodeId,
    config: ReplicaConfig,
    engine_factory: EngineFactory,
    control: std::sync::Arc<dyn ControlSink>,
    results: mpsc::UnboundedSender<HostEvent>,
) -> NodeSessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = NodeSession {
        node,
        handler: ReplicatedCutHandler::new(node, config.clone()),
        querier: LocalQueryProcessor::new(node, config.clone(), engine_factory, results),
        config,
        control,
        commands: rx,
        ticks: 0,
    };
    tokio::spawn(session.run());
    NodeSessionHandle { node, commands: tx }
}

struct NodeSession {
    node: SpaceNodeId,
    config: ReplicaConfig,
    handler: ReplicatedCutHandler,
    querier: LocalQueryProcessor,
    control: std::sync::Arc<dyn ControlSink>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    ticks: u64,
}

impl NodeSession {
    async fn run(mut self) {
        info!(node = %self.node, "replication context started");
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let coarsen_deadline = self.handler.next_coarsen_deadline();
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(NodeCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                _ = tick.tick() => self.tick(),
                _ = sleep_until_opt(coarsen_deadline) => {
                    self.handler.expire_unobserved(Instant::now());
                }
            }
            self.flush_control().await;
        }

        self.shutdown().await;
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::TopologyMessage(payload) => match TopologyUpdate::decode(&payload) {
                Ok(update) => {
                    let events = self.handler.handle_topology(update, Instant::now());
                    self.apply_replica_events(events);
                }
                Err(e) => warn!(node = %self.node, error = %e, "malformed topology message dropped"),
            },
            NodeCommand::PropertyMessage(payload) => match PropertyUpdate::decode(&payload) {
                Ok(update) => self.handler.handle_property(update, Instant::now()),
                Err(e) => warn!(node = %self.node, error = %e, "malformed property message dropped"),
            },
            NodeCommand::UpdateQuery { object, location, bounds, angle, max_results } => {
                let before = self.querier.active_query_count();
                self.querier.update_query(object, location, bounds, angle, max_results);
                if self.querier.active_query_count() > before {
                    self.handler.add_consumer();
                }
            }
            NodeCommand::RemoveQuery { object } => {
                if self.querier.remove_query(object) {
                    let events = self.handler.remove_consumer();
                    self.apply_replica_events(events);
                }
            }
            NodeCommand::Snapshot { reply } => {
                let snapshot = NodeSnapshot {
                    node: self.node,
                    phase: self.handler.phase(),
                    consumers: self.handler.consumer_count(),
                    queriers: self.querier.query_owners(),
                    indices: self.querier.index_summaries(),
                    handler_stats: self.handler.stats().clone(),
                    querier_stats: self.querier.stats().clone(),
                };
                let _ = reply.send(snapshot);
            }
            NodeCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn apply_replica_events(&mut self, events: Vec<ReplicaEvent>) {
        for event in events {
            match event {
                ReplicaEvent::IndexCreated { index, cache, source_server, dynamic } => {
                    cache.spawn_delivery();
                    self.querier.index_created(index, cache, source_server, dynamic);
                }
                ReplicaEvent::IndexRemoved { index } => {
                    self.querier.index_removed(index);
                }
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        for feedback in self.querier.tick(now) {
            match feedback {
                crate::querier::CutFeedback::Observed { index, node } => {
                    self.handler.queriers_are_observing(index, node);
                }
                crate::querier::CutFeedback::Unobserved { index, node } => {
                    self.handler.queriers_stopped_observing(index, node, now);
                }
            }
        }

        self.ticks += 1;
        if self.ticks % self.config.gc_interval_ticks == 0 {
            self.handler.gc(now);
        }
    }

    async fn flush_control(&mut self) {
        for action in self.handler.take_control() {
            match action.encode() {
                Ok(payload) => self.control.send_control(self.node, payload).await,
                Err(e) => error!(node = %self.node, error = %e, "control action encoding failed"),
            }
        }
    }

    async fn shutdown(mut self) {
        while self.handler.consumer_count() > 0 {
            let events = self.handler.remove_consumer();
            self.apply_replica_events(events);
        }
        self.querier.stop();
        self.flush_control().await;
        debug!(node = %self.node, "replication context stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

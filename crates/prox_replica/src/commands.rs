//! # Operational Command Surface
//!
//! Read-only admin commands over a running [`ProximityOrchestrator`],
//! answered from session snapshots. Hosts wire these into whatever admin
//! transport they already run; responses are JSON values so that transport
//! can stay generic.

use crate::replication::HandlerPhase;
use crate::runtime::NodeSnapshot;
use crate::session::ProximityOrchestrator;
use prox_types::{ObjectId, SpaceNodeId};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no replication context for node {0}")]
    UnknownNode(SpaceNodeId),

    #[error("unsupported command: {0}")]
    Unsupported(&'static str),

    #[error("response encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Parsed admin command.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    /// One summary row per replication handler.
    ListHandlers,
    /// Full detail for one handler: its replicated sub-trees and counters.
    ListNodes(SpaceNodeId),
    /// Every active querier and the node it queries.
    ListQueriers,
    /// Historic command; replicas rebuild themselves through the protocol,
    /// so this is rejected rather than silently ignored.
    ForceRebuild,
}

/// One row of the handler listing.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerEntry {
    pub node: SpaceNodeId,
    pub phase: HandlerPhase,
    pub consumers: usize,
    pub queriers: usize,
    pub indices: usize,
}

/// One row of the querier listing.
#[derive(Debug, Clone, Serialize)]
pub struct QuerierEntry {
    pub querier: ObjectId,
    pub node: SpaceNodeId,
}

/// Admin facade bound to one orchestrator.
pub struct AdminSurface {
    orchestrator: Arc<ProximityOrchestrator>,
}

impl AdminSurface {
    pub fn new(orchestrator: Arc<ProximityOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Executes a command and renders its response as JSON.
    pub async fn execute(&self, command: AdminCommand) -> Result<serde_json::Value, CommandError> {
        match command {
            AdminCommand::ListHandlers => Ok(serde_json::to_value(self.list_handlers().await)?),
            AdminCommand::ListNodes(node) => {
                Ok(serde_json::to_value(self.list_nodes(node).await?)?)
            }
            AdminCommand::ListQueriers => Ok(serde_json::to_value(self.list_queriers().await)?),
            AdminCommand::ForceRebuild => Err(CommandError::Unsupported(
                "replicas are rebuilt by re-establishing interest, not by command",
            )),
        }
    }

    /// Summarizes every live replication handler. Handlers that exit while
    /// being queried are skipped.
    pub async fn list_handlers(&self) -> Vec<HandlerEntry> {
        let mut entries = Vec::new();
        for snapshot in self.snapshots().await {
            entries.push(HandlerEntry {
                node: snapshot.node,
                phase: snapshot.phase,
                consumers: snapshot.consumers,
                queriers: snapshot.queriers.len(),
                indices: snapshot.indices.len(),
            });
        }
        entries
    }

    /// Full detail for one handler's replicated sub-trees and counters.
    pub async fn list_nodes(&self, node: SpaceNodeId) -> Result<NodeSnapshot, CommandError> {
        for handle in self.orchestrator.session_handles() {
            if handle.node() != node {
                continue;
            }
            return handle.snapshot().await.ok_or(CommandError::UnknownNode(node));
        }
        Err(CommandError::UnknownNode(node))
    }

    /// Lists every active query across all handlers.
    pub async fn list_queriers(&self) -> Vec<QuerierEntry> {
        let mut entries = Vec::new();
        for snapshot in self.snapshots().await {
            for querier in snapshot.queriers {
                entries.push(QuerierEntry { querier, node: snapshot.node });
            }
        }
        entries
    }

    async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let mut snapshots = Vec::new();
        for handle in self.orchestrator.session_handles() {
            if let Some(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|s| s.node);
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use crate::engine::basic_engine_factory;
    use crate::runtime::ControlSink;
    use crate::session::ResultSink;
    use crate::wire::{LocationResult, ProximityResult};
    use async_trait::async_trait;
    use prox_types::{BoundingSphere, NodeId, SpaceId, Vec3};
    use std::time::Duration;

    struct DiscardSink;

    #[async_trait]
    impl ControlSink for DiscardSink {
        async fn send_control(&self, _node: SpaceNodeId, _payload: Vec<u8>) {}
    }

    struct DiscardResults;

    #[async_trait]
    impl ResultSink for DiscardResults {
        async fn proximity_result(&self, _querier: ObjectId, _result: ProximityResult) {}
        async fn location_result(&self, _querier: ObjectId, _result: LocationResult) {}
    }

    fn surface() -> (AdminSurface, Arc<ProximityOrchestrator>) {
        let orchestrator = ProximityOrchestrator::new(
            ReplicaConfig::default(),
            basic_engine_factory(),
            Arc::new(DiscardSink),
            Arc::new(DiscardResults),
        );
        (AdminSurface::new(orchestrator.clone()), orchestrator)
    }

    #[tokio::test]
    async fn listings_reflect_live_sessions() {
        let (surface, orchestrator) = surface();
        assert!(surface.list_handlers().await.is_empty());

        let node = SpaceNodeId::new(SpaceId::new(), NodeId::new());
        let object = ObjectId::new();
        orchestrator
            .session_established(object, node, Vec3::ZERO, BoundingSphere::point())
            .unwrap();
        orchestrator.streams_ready(object).unwrap();
        orchestrator.query_request(object, r#"{"angle": 0.01}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handlers = surface.list_handlers().await;
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].node, node);
        assert_eq!(handlers[0].consumers, 1);
        assert_eq!(handlers[0].queriers, 1);

        let queriers = surface.list_queriers().await;
        assert_eq!(queriers.len(), 1);
        assert_eq!(queriers[0].querier, object);

        let detail = surface.list_nodes(node).await.unwrap();
        assert_eq!(detail.queriers, vec![object]);

        let rendered = surface.execute(AdminCommand::ListHandlers).await.unwrap();
        assert_eq!(rendered.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_node_and_force_rebuild_are_errors() {
        let (surface, _orchestrator) = surface();
        let node = SpaceNodeId::new(SpaceId::new(), NodeId::new());
        assert!(matches!(
            surface.list_nodes(node).await,
            Err(CommandError::UnknownNode(_))
        ));
        assert!(matches!(
            surface.execute(AdminCommand::ForceRebuild).await,
            Err(CommandError::Unsupported(_))
        ));
    }
}

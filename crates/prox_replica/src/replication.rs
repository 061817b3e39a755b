//! # Replicated Cut Management
//!
//! The per-remote-node protocol handler. It owns the local replica of every
//! sub-tree the remote space-server node exposes: it requests the replica
//! when the first local consumer appears, applies topology and property
//! messages to the per-sub-tree caches, parks out-of-order property deltas in
//! orphan buffers, and steers the replicated cut with refine and coarsen
//! requests derived from query observation feedback.
//!
//! The handler is a plain synchronous state machine. The session runtime
//! feeds it decoded messages from the replication context and drains its
//! control outbox onto the wire; nothing here touches a socket or a task.

use crate::cache::{ObjectSnapshot, PropertyCache};
use crate::config::ReplicaConfig;
use crate::orphans::OrphanedUpdateManager;
use crate::wire::{ControlAction, PropertyUpdate, TopologyUpdate};
use prox_types::{ObjectId, ProxIndexId, SpaceNodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of one handler, driven by its local consumer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HandlerPhase {
    /// No replica requested; inbound messages are unexpected and dropped.
    Uninitialized,
    /// `init` sent, first topology message not yet seen.
    Initializing,
    /// Replica live and updating.
    Active,
    /// `destroy` queued; tail messages are expected and dropped quietly.
    Destroying,
}

/// Replica lifecycle notifications handed to the query side.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A sub-tree replica came into existence; `cache` is the live store the
    /// query engine should bind to.
    IndexCreated {
        index: ProxIndexId,
        cache: Arc<PropertyCache>,
        source_server: Option<u32>,
        dynamic: bool,
    },
    /// A sub-tree replica was torn down.
    IndexRemoved { index: ProxIndexId },
}

/// Counters for one handler, exposed on the command surface.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct HandlerStats {
    pub topology_messages: u64,
    pub property_messages: u64,
    pub additions: u64,
    pub removals: u64,
    pub entries_applied: u64,
    pub entries_orphaned: u64,
    pub orphans_aged_out: u64,
}

struct IndexReplica {
    cache: Arc<PropertyCache>,
    orphans: OrphanedUpdateManager,
    source_server: Option<u32>,
    dynamic: bool,
    /// False for speculative replicas created by a property message that
    /// raced ahead of the index's first topology message.
    confirmed: bool,
}

/// Replicated-cut protocol handler for one remote `SpaceNodeId`.
pub struct ReplicatedCutHandler {
    node: SpaceNodeId,
    config: ReplicaConfig,
    phase: HandlerPhase,
    consumers: usize,
    replicas: HashMap<ProxIndexId, IndexReplica>,
    /// Replicated nodes with zero observers and the deadline after which a
    /// coarsen request goes out for them.
    unobserved: HashMap<(ProxIndexId, ObjectId), Instant>,
    outbox: Vec<ControlAction>,
    stats: HandlerStats,
}

impl ReplicatedCutHandler {
    pub fn new(node: SpaceNodeId, config: ReplicaConfig) -> Self {
        Self {
            node,
            config,
            phase: HandlerPhase::Uninitialized,
            consumers: 0,
            replicas: HashMap::new(),
            unobserved: HashMap::new(),
            outbox: Vec::new(),
            stats: HandlerStats::default(),
        }
    }

    pub fn phase(&self) -> HandlerPhase {
        self.phase
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers
    }

    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    // ------------------------------------------------------------------
    // Consumer refcounting
    // ------------------------------------------------------------------

    /// Registers a local consumer (one active query against this node).
    /// Only the 0→1 transition acts: it queues the `init` request.
    pub fn add_consumer(&mut self) {
        self.consumers += 1;
        if self.consumers > 1 {
            return;
        }
        match self.phase {
            HandlerPhase::Uninitialized | HandlerPhase::Destroying => {
                info!(node = %self.node, "requesting replica");
                self.outbox.push(ControlAction::Init);
                self.phase = HandlerPhase::Initializing;
            }
            HandlerPhase::Initializing | HandlerPhase::Active => {
                // Replica already requested; nothing to do.
            }
        }
    }

    /// Drops a local consumer. Only the transition to zero acts: it queues
    /// `destroy` and tears the replica down, notifying the query side of
    /// every removed index.
    pub fn remove_consumer(&mut self) -> Vec<ReplicaEvent> {
        debug_assert!(self.consumers > 0, "consumer refcount underflow");
        self.consumers = self.consumers.saturating_sub(1);
        if self.consumers > 0 {
            return Vec::new();
        }
        info!(node = %self.node, replicas = self.replicas.len(), "releasing replica");
        self.outbox.push(ControlAction::Destroy);
        self.phase = HandlerPhase::Destroying;
        self.unobserved.clear();
        let mut events = Vec::new();
        for (index, replica) in self.replicas.drain() {
            if replica.confirmed {
                events.push(ReplicaEvent::IndexRemoved { index });
            }
        }
        events
    }

    // ------------------------------------------------------------------
    // Inbound streams
    // ------------------------------------------------------------------

    /// Applies one topology message. Returns the replica lifecycle events it
    /// produced, in order.
    pub fn handle_topology(&mut self, update: TopologyUpdate, now: Instant) -> Vec<ReplicaEvent> {
        match self.phase {
            HandlerPhase::Uninitialized => {
                warn!(node = %self.node, index = %update.index, "topology message without a replica, dropped");
                return Vec::new();
            }
            HandlerPhase::Destroying => {
                debug!(node = %self.node, index = %update.index, "topology tail after destroy, dropped");
                return Vec::new();
            }
            HandlerPhase::Initializing => {
                self.phase = HandlerPhase::Active;
            }
            HandlerPhase::Active => {}
        }
        self.stats.topology_messages += 1;

        let mut events = Vec::new();
        let index = update.index;
        let replica = match self.replicas.get_mut(&index) {
            Some(replica) => {
                if !replica.confirmed {
                    // A property message got here first; the replica now
                    // becomes real and the query side learns about it.
                    if let Some(props) = &update.index_properties {
                        replica.source_server = props.source_server;
                        replica.dynamic = props.dynamic.unwrap_or(false);
                    }
                    replica.confirmed = true;
                    events.push(ReplicaEvent::IndexCreated {
                        index,
                        cache: replica.cache.clone(),
                        source_server: replica.source_server,
                        dynamic: replica.dynamic,
                    });
                }
                replica
            }
            None => {
                let props = update.index_properties.as_ref();
                if props.is_none() {
                    warn!(node = %self.node, %index, "first mention of index lacks properties, assuming static");
                }
                let replica = IndexReplica {
                    cache: PropertyCache::new(format!("{}/{}", self.node, index)),
                    orphans: OrphanedUpdateManager::new(),
                    source_server: props.and_then(|p| p.source_server),
                    dynamic: props.and_then(|p| p.dynamic).unwrap_or(false),
                    confirmed: true,
                };
                events.push(ReplicaEvent::IndexCreated {
                    index,
                    cache: replica.cache.clone(),
                    source_server: replica.source_server,
                    dynamic: replica.dynamic,
                });
                self.replicas.entry(index).or_insert(replica)
            }
        };

        for addition in &update.additions {
            let object = addition.object;
            replica.cache.object_added(ObjectSnapshot::from(addition));
            // Deltas that raced ahead of this addition replay now, in
            // arrival order; stale ones fall to the seqno checks.
            for fields in replica.orphans.take(object) {
                replica.cache.apply_field_updates(object, &fields);
            }
            self.stats.additions += 1;
        }

        for removal in &update.removals {
            match replica.cache.object_removed(removal.object, removal.permanent) {
                Some(parked) if !removal.permanent => {
                    // The object may re-enter this sub-tree. Parking its last
                    // values keeps the staleness floor across the gap: they
                    // replay on re-addition and outrank older deltas.
                    replica.orphans.add(removal.object, parked.as_field_updates(), now);
                }
                _ => {}
            }
            self.unobserved.remove(&(index, removal.object));
            self.stats.removals += 1;
        }

        // A vacant replica is torn down entirely; the server announcing the
        // sub-tree again later starts it over with fresh bookkeeping.
        let went_vacant = !update.removals.is_empty() && replica.cache.empty();
        if went_vacant {
            self.replicas.remove(&index);
            self.unobserved.retain(|(i, _), _| *i != index);
            info!(node = %self.node, %index, "replica went vacant, resetting");
            events.push(ReplicaEvent::IndexRemoved { index });
        }

        events
    }

    /// Applies one property message across the sub-trees it names.
    pub fn handle_property(&mut self, update: PropertyUpdate, now: Instant) {
        match self.phase {
            HandlerPhase::Uninitialized => {
                warn!(node = %self.node, "property message without a replica, dropped");
                return;
            }
            HandlerPhase::Destroying => {
                debug!(node = %self.node, "property tail after destroy, dropped");
                return;
            }
            _ => {}
        }
        self.stats.property_messages += 1;

        for entry in update.updates {
            if entry.index_ids.is_empty() {
                error!(node = %self.node, object = %entry.object, "property entry names no index, dropped");
                continue;
            }
            if entry.fields.is_empty() {
                debug!(node = %self.node, object = %entry.object, "empty property entry, dropped");
                continue;
            }
            for index in &entry.index_ids {
                let replica = self.replicas.entry(*index).or_insert_with(|| {
                    // Property stream raced ahead of the index's first
                    // topology message. Buffer under a speculative replica
                    // until topology confirms it.
                    debug!(node = %self.node, %index, "speculative replica for early property update");
                    IndexReplica {
                        cache: PropertyCache::new(format!("{}/{}", self.node, index)),
                        orphans: OrphanedUpdateManager::new(),
                        source_server: None,
                        dynamic: false,
                        confirmed: false,
                    }
                });
                if replica.cache.contains(entry.object) {
                    replica.cache.apply_field_updates(entry.object, &entry.fields);
                    self.stats.entries_applied += 1;
                } else {
                    replica.orphans.add(entry.object, entry.fields.clone(), now);
                    self.stats.entries_orphaned += 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Cut steering
    // ------------------------------------------------------------------

    /// A replicated node gained its first observer: cancel any pending
    /// coarsen for it and ask the server to refine below it immediately.
    pub fn queriers_are_observing(&mut self, index: ProxIndexId, node: ObjectId) {
        self.unobserved.remove(&(index, node));
        if !self.replicas.contains_key(&index) {
            return;
        }
        match self.outbox.last_mut() {
            Some(ControlAction::Refine { nodes }) => {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
            _ => self.outbox.push(ControlAction::Refine { nodes: vec![node] }),
        }
    }

    /// A replicated node lost its last observer: start its coarsen timer.
    pub fn queriers_stopped_observing(&mut self, index: ProxIndexId, node: ObjectId, now: Instant) {
        if !self.replicas.contains_key(&index) {
            return;
        }
        self.unobserved
            .insert((index, node), now + self.config.unobserved_timeout());
    }

    /// Earliest pending coarsen deadline, for the session's timer.
    pub fn next_coarsen_deadline(&self) -> Option<Instant> {
        self.unobserved.values().min().copied()
    }

    /// Coarsens every node whose unobserved timer has expired. Returns how
    /// many nodes were coarsened.
    pub fn expire_unobserved(&mut self, now: Instant) -> usize {
        let expired: Vec<(ProxIndexId, ObjectId)> = self
            .unobserved
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        let mut nodes = Vec::with_capacity(expired.len());
        for key in &expired {
            self.unobserved.remove(key);
            nodes.push(key.1);
        }
        debug!(node = %self.node, count = nodes.len(), "coarsening unobserved nodes");
        self.outbox.push(ControlAction::Coarsen { nodes });
        expired.len()
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Ages out stale orphan buffers and drops speculative replicas whose
    /// confirming topology message never came.
    pub fn gc(&mut self, now: Instant) {
        let max_age = self.config.orphan_max_age();
        let mut aged = 0;
        self.replicas.retain(|index, replica| {
            aged += replica.orphans.cleanup(max_age, now);
            let keep = replica.confirmed
                || !replica.orphans.is_empty()
                || !replica.cache.fully_empty();
            if !keep {
                debug!(node = %self.node, %index, "dropped unconfirmed speculative replica");
            }
            keep
        });
        self.stats.orphans_aged_out += aged as u64;
    }

    /// Drains queued control actions for the wire, oldest first. Draining a
    /// `destroy` completes the teardown.
    pub fn take_control(&mut self) -> Vec<ControlAction> {
        let actions = std::mem::take(&mut self.outbox);
        if self.phase == HandlerPhase::Destroying
            && actions.iter().any(|a| matches!(a, ControlAction::Destroy))
        {
            self.phase = HandlerPhase::Uninitialized;
        }
        actions
    }
}

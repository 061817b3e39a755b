//! # Wire Message Schema
//!
//! Message types exchanged with a remote space-server node over an already
//! established session, plus the textual control-channel actions used to
//! manage the replicated cut. Transport and connection establishment live
//! outside this crate; callers hand raw message bytes in and control bytes
//! out.
//!
//! Two inbound streams exist per session and are logically independent:
//! topology messages ([`TopologyUpdate`], the "prox" stream) and property
//! messages ([`PropertyUpdate`], the "loc" stream). No ordering is guaranteed
//! between them, which is why the replication handler keeps orphan buffers.

use prox_types::{BoundingSphere, ObjectId, ProxIndexId, Quaternion, Sequenced, SolidAngle, Vec3};
use serde::{Deserialize, Serialize};

/// Errors produced while encoding or decoding wire messages.
///
/// Malformed inbound messages are logged and dropped by callers; the session
/// is never torn down on this basis alone.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid query request: {0}")]
    InvalidQueryRequest(String),
}

// ============================================================================
// Control channel
// ============================================================================

/// An action request sent on the session's reliable control sub-channel.
///
/// Encoded as short textual JSON: `{"action":"init"}`,
/// `{"action":"refine","nodes":[...]}` and so on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlAction {
    /// Request a live partial replica of the server's spatial tree.
    Init,
    /// Tear down the replica; no further updates are expected after this.
    Destroy,
    /// Push the cut toward the leaves below the named nodes.
    Refine { nodes: Vec<ObjectId> },
    /// Pull the cut up to the named nodes.
    Coarsen { nodes: Vec<ObjectId> },
}

impl ControlAction {
    /// Serializes the action for the control channel.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ============================================================================
// Topology ("prox") stream
// ============================================================================

/// Classification info for a replicated sub-tree, present only in the first
/// topology message that mentions the index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexProperties {
    /// ID of the source server that contributed this sub-tree, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_server: Option<u32>,
    /// Whether the sub-tree indexes dynamic (moving) objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<bool>,
}

/// Distinguishes real objects from internal tree nodes (aggregates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// A leaf object hosted by some object host.
    Object,
    /// An internal node of the replicated tree.
    Aggregate,
}

impl Default for ObjectKind {
    fn default() -> Self {
        ObjectKind::Object
    }
}

/// A full property snapshot announcing an object's arrival in one sub-tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAddition {
    pub object: ObjectId,
    /// Parent node in the replicated tree, absent for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ObjectId>,
    #[serde(default)]
    pub kind: ObjectKind,
    pub location: Sequenced<Vec3>,
    pub orientation: Sequenced<Quaternion>,
    pub bounds: Sequenced<BoundingSphere>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<Sequenced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physics: Option<Sequenced<String>>,
}

/// Notice that an object left one sub-tree of the replica.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectRemoval {
    pub object: ObjectId,
    /// `true` when the object was destroyed, `false` when it merely moved
    /// out of the replicated cut and may reappear.
    #[serde(default)]
    pub permanent: bool,
}

/// One topology message: additions and removals for a single sub-tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub index: ProxIndexId,
    /// Present only the first time this index is mentioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_properties: Option<IndexProperties>,
    #[serde(default)]
    pub additions: Vec<ObjectAddition>,
    #[serde(default)]
    pub removals: Vec<ObjectRemoval>,
}

impl TopologyUpdate {
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ============================================================================
// Property ("loc") stream
// ============================================================================

/// The independently sequence-numbered fields of one property delta.
///
/// Every field is optional; an absent field is simply not part of the delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Sequenced<Vec3>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Sequenced<Quaternion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Sequenced<BoundingSphere>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<Sequenced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physics: Option<Sequenced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Sequenced<ObjectId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<Sequenced<u64>>,
}

impl FieldUpdates {
    /// Whether the delta carries no fields at all.
    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.orientation.is_none()
            && self.bounds.is_none()
            && self.mesh.is_none()
            && self.physics.is_none()
            && self.parent.is_none()
            && self.epoch.is_none()
    }
}

/// One property delta, applicable to every sub-tree named in `index_ids`.
///
/// An object may be visible in multiple replicated sub-trees at once. An
/// empty `index_ids` list is a protocol invariant violation and the entry is
/// dropped with an error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdateEntry {
    pub object: ObjectId,
    pub index_ids: Vec<ProxIndexId>,
    #[serde(flatten)]
    pub fields: FieldUpdates,
}

/// One property message: a batch of deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub updates: Vec<PropertyUpdateEntry>,
}

impl PropertyUpdate {
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ============================================================================
// Query request strings
// ============================================================================

/// A parsed per-object query request.
///
/// The textual form is `{"angle": <f64>, "max_results": <u32>}`; absent
/// fields mean "no constraint". An empty request string is a cancellation
/// and is handled before parsing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
}

impl QueryRequest {
    /// Parses a non-empty query request string.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text)
            .map_err(|e| WireError::InvalidQueryRequest(format!("{text:?}: {e}")))
    }

    /// The solid-angle constraint, defaulting to "everything" when absent.
    pub fn solid_angle(&self) -> SolidAngle {
        self.angle.map(SolidAngle).unwrap_or(SolidAngle::MIN)
    }

    /// The result-count cap; `0` means unconstrained.
    pub fn result_cap(&self) -> u32 {
        self.max_results.unwrap_or(0)
    }
}

// ============================================================================
// Outbound results (to the owning object)
// ============================================================================

/// An object entering a query's result set, with a full property snapshot
/// taken at delivery time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityAddition {
    pub object: ObjectId,
    pub location: Sequenced<Vec3>,
    pub orientation: Sequenced<Quaternion>,
    /// Aggregate bounds for internal nodes, object bounds for leaves.
    pub bounds: Sequenced<BoundingSphere>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<Sequenced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physics: Option<Sequenced<String>>,
}

/// An object leaving a query's result set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityRemoval {
    pub object: ObjectId,
    /// `true` for destruction, `false` for cut movement or falling below the
    /// query's constraints.
    pub permanent: bool,
}

/// One query-tick's worth of result-set changes for a single querier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProximityResult {
    #[serde(default)]
    pub additions: Vec<ProximityAddition>,
    #[serde(default)]
    pub removals: Vec<ProximityRemoval>,
}

impl ProximityResult {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// A property delta forwarded to a querier subscribed to `object`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub object: ObjectId,
    #[serde(flatten)]
    pub fields: FieldUpdates,
}

//! # Core Type Definitions
//!
//! Fundamental types shared across the replicated-cut proximity service.
//! These provide the vocabulary for object identity, replication sources,
//! world-space geometry, and per-field sequence versioning.
//!
//! ## Key Types
//!
//! - [`ObjectId`] - Unique identifier for an object within one space
//! - [`SpaceNodeId`] - (space, node) pair naming one remote replication source
//! - [`ProxIndexId`] - One independently replicated sub-tree of a remote node
//! - [`Sequenced`] - A value paired with the sequence number that produced it
//!
//! ## Design Principles
//!
//! - **Type Safety**: Wrapper types prevent ID confusion (ObjectId vs NodeId)
//! - **Precision**: Double-precision floats for accurate large-world positioning
//! - **Serialization**: All types support JSON serialization for network transmission

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an object, scoped to one space.
///
/// This is a wrapper around UUID that provides type safety and ensures
/// object references cannot be confused with other kinds of IDs. Replicated
/// tree-internal nodes (aggregates) are addressed by `ObjectId` as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    /// Creates a new random object ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an object ID from its string representation.
    pub fn from_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a space (one partitioned virtual world).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpaceId(pub Uuid);

impl SpaceId {
    /// Creates a new random space ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one space-server node within a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one remote replication source: a (space, node) pair.
///
/// Exactly one protocol handler and one local query processor exist per
/// `SpaceNodeId` for the lifetime of the session with that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpaceNodeId {
    /// The space this session belongs to
    pub space: SpaceId,
    /// The remote space-server node
    pub node: NodeId,
}

impl SpaceNodeId {
    /// Creates a new space-node pair.
    pub fn new(space: SpaceId, node: NodeId) -> Self {
        Self { space, node }
    }
}

impl std::fmt::Display for SpaceNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.space, self.node)
    }
}

/// Identifies one independently replicated sub-tree exposed by a remote node.
///
/// A node may expose several (e.g. one per contributing source server, or a
/// static/dynamic split). IDs are assigned by the server and are only
/// meaningful within one `SpaceNodeId` session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxIndexId(pub u32);

impl std::fmt::Display for ProxIndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index-{}", self.0)
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// A 3D position or direction in world space.
///
/// Uses double precision; single-precision error is visible in large
/// partitioned worlds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// The origin.
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    /// Creates a new vector with the specified coordinates.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean distance to another point.
    pub fn distance_squared(&self, other: Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: Vec3) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Unit quaternion orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    /// The identity rotation.
    pub const IDENTITY: Quaternion = Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Bounding sphere of an object or of a query's region of interest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingSphere {
    /// Center of the sphere, relative to the owning object's location
    /// when used as object bounds, absolute when used as a query region.
    pub center: Vec3,
    /// Sphere radius; zero for point objects.
    pub radius: f64,
}

impl BoundingSphere {
    /// Creates a new bounding sphere.
    pub fn new(center: Vec3, radius: f64) -> Self {
        Self { center, radius }
    }

    /// A degenerate point sphere at the origin.
    pub fn point() -> Self {
        Self { center: Vec3::ZERO, radius: 0.0 }
    }

    /// Whether the given point lies within the sphere.
    pub fn contains(&self, point: Vec3) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }
}

impl Default for BoundingSphere {
    fn default() -> Self {
        Self::point()
    }
}

/// Solid angle in steradians: how large an object appears from a viewpoint.
///
/// The full sphere is `4π` steradians. [`SolidAngle::NO_UPDATE`] is the
/// sentinel meaning "this query-update call does not change the angle
/// constraint"; it never appears as a real measurement.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct SolidAngle(pub f64);

impl SolidAngle {
    /// The smallest representable constraint (matches everything visible).
    pub const MIN: SolidAngle = SolidAngle(0.0);
    /// The full sphere.
    pub const MAX: SolidAngle = SolidAngle(4.0 * std::f64::consts::PI);
    /// Sentinel: leave the current constraint unchanged.
    pub const NO_UPDATE: SolidAngle = SolidAngle(f64::MAX);

    /// Whether this value is the no-update sentinel.
    pub fn is_no_update(&self) -> bool {
        self.0 == f64::MAX
    }

    /// Apparent solid angle of a sphere of radius `radius` whose center is
    /// `distance` away. Returns [`SolidAngle::MAX`] when the viewpoint is
    /// inside the sphere.
    pub fn from_radius_and_distance(radius: f64, distance: f64) -> SolidAngle {
        if distance <= radius {
            return Self::MAX;
        }
        let sin_sq = (radius / distance) * (radius / distance);
        // 2π(1 − cos θ) with sin θ = r/d
        SolidAngle(2.0 * std::f64::consts::PI * (1.0 - (1.0 - sin_sq).sqrt()))
    }
}

// ============================================================================
// Sequence versioning
// ============================================================================

/// A value paired with the sequence number of the update that produced it.
///
/// Fields of a replicated property record are independently versioned: each
/// carries its own sequence number, and an incoming update is applied only if
/// its number is strictly newer than the stored one. There is no ordering
/// relationship between sequence numbers of different fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sequenced<T> {
    /// The current value.
    pub value: T,
    /// Sequence number of the update that set it.
    pub seqno: u64,
}

impl<T> Sequenced<T> {
    /// Creates a sequenced value.
    pub fn new(value: T, seqno: u64) -> Self {
        Self { value, seqno }
    }

    /// Applies `update` iff it is strictly newer than the stored value.
    /// Returns `true` when the value changed.
    pub fn apply_if_newer(&mut self, update: Sequenced<T>) -> bool {
        if update.seqno > self.seqno {
            *self = update;
            true
        } else {
            false
        }
    }
}

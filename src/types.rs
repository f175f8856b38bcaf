//! Core type definitions shared across the write path
//!
//! Identifiers are opaque client-supplied byte strings; the engine routes on
//! their 64-bit hash and keeps the full bytes for collision-safe equality.
//! Epochs are issued by the WAL at commit time and are the only version
//! authority; timestamps are informational and never used for tie-breaking.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotone version stamp issued by the WAL at commit
pub type Epoch = u64;

/// Microseconds since the Unix epoch (informational only)
pub type Timestamp = u64;

/// 64-bit routing hash of a [`VectorId`]
pub type IdHash = u64;

/// Small integer tag identifier
pub type TagId = u32;

/// Precomputed centroid assignment, stored pass-through for the downstream index
pub type CentroidId = u16;

/// Current microsecond timestamp
pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Opaque client-supplied vector identifier
///
/// Cheap to clone; uniqueness is scoped to (tenant, namespace, id) by the
/// caller, but the engine treats the identity hash as the routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VectorId(pub Bytes);

impl VectorId {
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for VectorId {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for VectorId {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl std::fmt::Display for VectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Write operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpKind {
    Insert = 0,
    Upsert = 1,
    Delete = 2,
}

impl OpKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpKind::Insert),
            1 => Some(OpKind::Upsert),
            2 => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// A single vector record as it moves through the write path
///
/// Delete operations carry a minimal entry: identity only, empty vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: VectorId,
    pub id_hash: IdHash,
    pub vector: Vec<f32>,
    pub tenant: String,
    pub namespace: String,
    pub tags: Vec<TagId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub centroid_id: CentroidId,
    pub deleted: bool,
}

impl VectorEntry {
    pub fn new(
        id: VectorId,
        vector: Vec<f32>,
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        tags: Vec<TagId>,
    ) -> Self {
        let id_hash = crate::hash::identity_hash(id.as_bytes());
        let now = now_micros();
        Self {
            id,
            id_hash,
            vector,
            tenant: tenant.into(),
            namespace: namespace.into(),
            tags,
            created_at: now,
            updated_at: now,
            centroid_id: 0,
            deleted: false,
        }
    }

    /// Minimal entry for a delete operation: identity only
    pub fn tombstone(id: VectorId) -> Self {
        let id_hash = crate::hash::identity_hash(id.as_bytes());
        let now = now_micros();
        Self {
            id,
            id_hash,
            vector: Vec::new(),
            tenant: String::new(),
            namespace: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            centroid_id: 0,
            deleted: true,
        }
    }
}

/// A buffered write: operation kind, payload, and the WAL-issued epoch
#[derive(Debug, Clone)]
pub struct Message {
    pub op: OpKind,
    pub entry: VectorEntry,
    pub epoch: Epoch,
    pub timestamp: Timestamp,
}

/// Where the authoritative copy of an identity currently lives
#[derive(Debug, Clone, PartialEq)]
pub enum LocationKind {
    /// Still in the in-memory message buffer
    Buffer,
    /// Persisted into an on-disk segment at the given row
    Segment { segment_id: String, local_row: u32 },
    /// Tombstoned; no live copy exists
    Deleted,
}

/// Location record tracked by the latest-by-id map
///
/// A `Deleted` kind is the authoritative in-memory tombstone; a `Segment`
/// location with `tombstone = true` means the tombstone has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorLocation {
    pub kind: LocationKind,
    pub timestamp: Timestamp,
    pub epoch: Epoch,
    pub tombstone: bool,
}

impl VectorLocation {
    pub fn buffer(timestamp: Timestamp, epoch: Epoch) -> Self {
        Self {
            kind: LocationKind::Buffer,
            timestamp,
            epoch,
            tombstone: false,
        }
    }

    pub fn deleted(timestamp: Timestamp, epoch: Epoch) -> Self {
        Self {
            kind: LocationKind::Deleted,
            timestamp,
            epoch,
            tombstone: true,
        }
    }

    pub fn segment(
        segment_id: impl Into<String>,
        local_row: u32,
        timestamp: Timestamp,
        epoch: Epoch,
        tombstone: bool,
    ) -> Self {
        Self {
            kind: LocationKind::Segment {
                segment_id: segment_id.into(),
                local_row,
            },
            timestamp,
            epoch,
            tombstone,
        }
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, LocationKind::Buffer)
    }

    pub fn is_segment(&self) -> bool {
        matches!(self.kind, LocationKind::Segment { .. })
    }

    pub fn segment_id(&self) -> Option<&str> {
        match &self.kind {
            LocationKind::Segment { segment_id, .. } => Some(segment_id),
            _ => None,
        }
    }
}

/// Inclusive range of identity hashes, used for tree routing and leaf slicing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub lo: IdHash,
    pub hi: IdHash,
}

impl HashRange {
    pub const FULL: HashRange = HashRange {
        lo: 0,
        hi: u64::MAX,
    };

    pub fn new(lo: IdHash, hi: IdHash) -> Self {
        debug_assert!(lo <= hi);
        Self { lo, hi }
    }

    pub fn contains(&self, hash: IdHash) -> bool {
        self.lo <= hash && hash <= self.hi
    }

    pub fn overlaps(&self, lo: IdHash, hi: IdHash) -> bool {
        self.lo <= hi && lo <= self.hi
    }

    /// Midpoint used when splitting a leaf range in two
    pub fn midpoint(&self) -> IdHash {
        self.lo + (self.hi - self.lo) / 2
    }
}

/// Descriptor of an immutable on-disk segment, as returned by the encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub segment_id: String,
    pub file_path: std::path::PathBuf,
    pub num_vectors: u64,
    pub min_id_hash: IdHash,
    pub max_id_hash: IdHash,
    pub min_epoch: Epoch,
    pub max_epoch: Epoch,
    pub tombstone_ratio: f32,
    pub created_at: Timestamp,
    /// false = delta segment, true = stable (compacted)
    pub is_stable: bool,
}

/// Row-table entry persisted per vector in a segment, consumed by recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRow {
    pub id: VectorId,
    pub id_hash: IdHash,
    pub epoch: Epoch,
    pub tombstone: bool,
    pub local_row: u32,
}

/// Filter applied by the buffer's query scan
///
/// Empty tenant/namespace match everything; tags use any-of overlap.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub tenant: String,
    pub namespace: String,
    pub tags_any: Vec<TagId>,
}

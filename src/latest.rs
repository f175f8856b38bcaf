//! Latest-by-id location index
//!
//! The single source of truth for "where does the current version of
//! identity X live?": buffer, segment, or tombstone. Updates are guarded by
//! epoch: a write with an older epoch than the installed entry is dropped,
//! so a late flush completion can never resurrect a stale location.

use crate::types::{
    Epoch, IdHash, LocationKind, SegmentDescriptor, SegmentRow, Timestamp, VectorId,
    VectorLocation,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One flushed row handed to [`LatestByIdMap::move_to_segment`]
///
/// Each row carries the epoch it was flushed under; the move is skipped for
/// any identity whose installed epoch is newer (re-written during the flush).
#[derive(Debug, Clone)]
pub struct SegmentAssignment {
    pub id_hash: IdHash,
    pub local_row: u32,
    pub epoch: Epoch,
}

struct MapEntry {
    id: VectorId,
    location: VectorLocation,
}

#[derive(Default)]
struct Inner {
    /// Primary table: identity hash -> entry
    by_hash: HashMap<IdHash, MapEntry>,
    /// Secondary index: full identifier -> hash, for exact lookups
    by_id: HashMap<VectorId, IdHash>,
}

/// Thread-safe latest-by-id map
///
/// A single reader-writer lock protects both tables; the location counters
/// are atomics mutated only while the write lock is held, so their sum is
/// exact at any quiescent point.
pub struct LatestByIdMap {
    inner: RwLock<Inner>,
    buffer_count: AtomicUsize,
    segment_count: AtomicUsize,
    tombstone_count: AtomicUsize,
}

/// Snapshot counts of map occupancy
#[derive(Debug, Clone, Serialize)]
pub struct MapStats {
    pub total_entries: usize,
    pub buffer_entries: usize,
    pub segment_entries: usize,
    pub tombstone_entries: usize,
}

impl Default for LatestByIdMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestByIdMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            buffer_count: AtomicUsize::new(0),
            segment_count: AtomicUsize::new(0),
            tombstone_count: AtomicUsize::new(0),
        }
    }

    /// Install `location` for `id` unless an entry with a newer epoch exists
    pub fn upsert(&self, id: VectorId, id_hash: IdHash, location: VectorLocation) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        match inner.by_hash.entry(id_hash) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                // Epoch guard: out-of-order arrivals are dropped
                if location.epoch < entry.location.epoch {
                    return;
                }
                self.count_removed(&entry.location);
                self.count_installed(&location);
                entry.location = location;
            }
            Entry::Vacant(vacant) => {
                self.count_installed(&location);
                vacant.insert(MapEntry {
                    id: id.clone(),
                    location,
                });
                inner.by_id.insert(id, id_hash);
            }
        }
    }

    /// Install a tombstone location for `id`
    pub fn mark_deleted(&self, id: VectorId, id_hash: IdHash, timestamp: Timestamp, epoch: Epoch) {
        self.upsert(id, id_hash, VectorLocation::deleted(timestamp, epoch));
    }

    /// Current location for an identity, tombstones included
    pub fn get_latest(&self, id: &VectorId) -> Option<VectorLocation> {
        let inner = self.inner.read();
        let hash = inner.by_id.get(id)?;
        inner.by_hash.get(hash).map(|e| e.location.clone())
    }

    /// Current location by identity hash, tombstones included
    pub fn get_latest_by_hash(&self, id_hash: IdHash) -> Option<VectorLocation> {
        let inner = self.inner.read();
        inner.by_hash.get(&id_hash).map(|e| e.location.clone())
    }

    /// True iff a non-tombstoned entry exists
    pub fn exists(&self, id: &VectorId) -> bool {
        self.get_latest(id).map(|l| !l.tombstone).unwrap_or(false)
    }

    /// True iff a non-tombstoned entry exists for the hash
    pub fn exists_by_hash(&self, id_hash: IdHash) -> bool {
        self.get_latest_by_hash(id_hash)
            .map(|l| !l.tombstone)
            .unwrap_or(false)
    }

    /// Drop every entry located in `segment_id`; used by compaction
    pub fn remove_segment_entries(&self, segment_id: &str) {
        let mut inner = self.inner.write();
        let mut removed_ids = Vec::new();

        inner.by_hash.retain(|_, entry| {
            let matches = matches!(
                &entry.location.kind,
                LocationKind::Segment { segment_id: sid, .. } if sid == segment_id
            );
            if matches {
                self.count_removed(&entry.location);
                removed_ids.push(entry.id.clone());
            }
            !matches
        });

        for id in removed_ids {
            inner.by_id.remove(&id);
        }
    }

    /// Reassign flushed identities from buffer to `segment_id`
    ///
    /// Rows whose installed epoch is newer than the epoch they were flushed
    /// under are skipped: the identity was re-written during the flush and
    /// its buffer location stays authoritative.
    pub fn move_to_segment(&self, rows: &[SegmentAssignment], segment_id: &str) {
        let mut inner = self.inner.write();

        for row in rows {
            let Some(entry) = inner.by_hash.get_mut(&row.id_hash) else {
                continue;
            };
            if entry.location.epoch > row.epoch {
                continue;
            }

            self.count_removed(&entry.location);
            let moved = VectorLocation::segment(
                segment_id,
                row.local_row,
                entry.location.timestamp,
                row.epoch,
                entry.location.tombstone,
            );
            self.count_installed(&moved);
            entry.location = moved;
        }
    }

    /// Reconstruct the map from recovered segment row tables, keeping the
    /// highest epoch per identity
    pub fn rebuild(&self, segments: &[(SegmentDescriptor, Vec<SegmentRow>)]) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.by_hash.clear();
        inner.by_id.clear();
        self.buffer_count.store(0, Ordering::Relaxed);
        self.segment_count.store(0, Ordering::Relaxed);
        self.tombstone_count.store(0, Ordering::Relaxed);

        for (descriptor, rows) in segments {
            for row in rows {
                let location = VectorLocation::segment(
                    &descriptor.segment_id,
                    row.local_row,
                    descriptor.created_at,
                    row.epoch,
                    row.tombstone,
                );
                match inner.by_hash.entry(row.id_hash) {
                    Entry::Occupied(mut occupied) => {
                        let entry = occupied.get_mut();
                        if entry.location.epoch >= row.epoch {
                            continue;
                        }
                        self.count_removed(&entry.location);
                        self.count_installed(&location);
                        entry.location = location;
                    }
                    Entry::Vacant(vacant) => {
                        self.count_installed(&location);
                        vacant.insert(MapEntry {
                            id: row.id.clone(),
                            location,
                        });
                        inner.by_id.insert(row.id.clone(), row.id_hash);
                    }
                }
            }
        }

        tracing::info!(
            segments = segments.len(),
            entries = inner.by_hash.len(),
            "latest-by-id map rebuilt"
        );
    }

    /// Drop all entries (recovery/testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_hash.clear();
        inner.by_id.clear();
        self.buffer_count.store(0, Ordering::Relaxed);
        self.segment_count.store(0, Ordering::Relaxed);
        self.tombstone_count.store(0, Ordering::Relaxed);
    }

    /// Snapshot occupancy counts
    pub fn stats(&self) -> MapStats {
        let inner = self.inner.read();
        MapStats {
            total_entries: inner.by_hash.len(),
            buffer_entries: self.buffer_count.load(Ordering::Relaxed),
            segment_entries: self.segment_count.load(Ordering::Relaxed),
            tombstone_entries: self.tombstone_count.load(Ordering::Relaxed),
        }
    }

    fn count_installed(&self, location: &VectorLocation) {
        match location.kind {
            LocationKind::Buffer => {
                self.buffer_count.fetch_add(1, Ordering::Relaxed);
            }
            LocationKind::Segment { .. } => {
                self.segment_count.fetch_add(1, Ordering::Relaxed);
            }
            LocationKind::Deleted => {}
        }
        if location.tombstone {
            self.tombstone_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn count_removed(&self, location: &VectorLocation) {
        match location.kind {
            LocationKind::Buffer => {
                self.buffer_count.fetch_sub(1, Ordering::Relaxed);
            }
            LocationKind::Segment { .. } => {
                self.segment_count.fetch_sub(1, Ordering::Relaxed);
            }
            LocationKind::Deleted => {}
        }
        if location.tombstone {
            self.tombstone_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

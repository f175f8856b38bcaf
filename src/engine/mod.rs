//! Engine facade: wiring, recovery, and the public write/read surface
//!
//! The engine owns the WAL, the manifest, and the tree; the tree owns the
//! message buffer and the latest-by-id map. Every write commits to the WAL
//! first (receiving its epoch) and is then handed to the tree; queries get
//! the buffer's unranked contribution plus per-identity location lookups for
//! read-your-writes resolution against segment results.

use crate::betree::{BEpsilonTree, FlushOutcome, TreeStats};
use crate::buffer::{BufferStats, MessageBuffer};
use crate::config::Config;
use crate::defaults::{DEFAULT_APPEND_DEADLINE_MS, MAX_TAGS_PER_ENTRY, WAL_FILE_NAME};
use crate::error::{Result, SiltError};
use crate::latest::{LatestByIdMap, MapStats};
use crate::manifest::{Manifest, ManifestState, ManifestStore};
use crate::segment::SegmentEncoder;
use crate::types::{
    Epoch, Message, OpKind, QueryFilter, TagId, VectorEntry, VectorId, VectorLocation,
};
use crate::wal::Wal;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Engine-wide statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub buffer: BufferStats,
    pub map: MapStats,
    pub tree: TreeStats,
    pub wal_epoch: Epoch,
    pub manifest_generation: u64,
    pub segment_count: usize,
}

/// Write-path storage engine
pub struct Engine {
    config: Config,
    wal: Wal,
    tree: BEpsilonTree,
    manifest: Arc<ManifestState>,
    append_deadline: Duration,
    /// Keeps the WAL→tree hand-off in epoch order: the tree requires
    /// strictly increasing epochs, so issuance and acceptance must not
    /// interleave across writers
    commit_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Open the engine in `data_dir`, recovering state from the manifest and
    /// the WAL
    ///
    /// Recovery order: rebuild the latest-by-id map from the manifest's
    /// segment row tables, rebind leaves, then replay the WAL. A replayed
    /// record re-enters the buffer only when its epoch is newer than the
    /// rebuilt map's entry for that identity: flush batches are sliced in
    /// shard order, not epoch order, so a global replay cutoff would either
    /// drop or duplicate records.
    pub async fn open(
        config: Config,
        data_dir: impl AsRef<Path>,
        encoder: Arc<dyn SegmentEncoder>,
    ) -> Result<Self> {
        config.validate()?;
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;

        let store = ManifestStore::new(data_dir);
        let manifest = store.load().await?.unwrap_or_default();
        let manifest = Arc::new(ManifestState::new(manifest, store));

        let latest = Arc::new(LatestByIdMap::new());
        let buffer = Arc::new(MessageBuffer::new(config.buffer.clone(), latest.clone()));

        let snapshot = manifest.snapshot();
        let mut segment_tables = Vec::with_capacity(snapshot.segments.len());
        for descriptor in &snapshot.segments {
            let rows = encoder.read_row_table(descriptor).await?;
            segment_tables.push((descriptor.clone(), rows));
        }
        if !segment_tables.is_empty() {
            latest.rebuild(&segment_tables);
        }

        let tree = BEpsilonTree::new(
            config.btree.clone(),
            buffer,
            latest,
            encoder,
            manifest.clone(),
        );
        tree.rebind_segments(&snapshot.segments);

        let wal = Wal::open(data_dir.join(WAL_FILE_NAME), config.wal.clone()).await?;

        let engine = Self {
            append_deadline: Duration::from_millis(DEFAULT_APPEND_DEADLINE_MS),
            config,
            wal,
            tree,
            manifest,
            commit_lock: tokio::sync::Mutex::new(()),
        };
        let replayed = engine.replay_wal().await?;

        tracing::info!(
            segments = snapshot.segments.len(),
            replayed,
            wal_epoch = engine.wal.current_epoch(),
            "engine opened"
        );
        Ok(engine)
    }

    /// Replay WAL records newer than the rebuilt map back into the buffer
    async fn replay_wal(&self) -> Result<usize> {
        let records = self.wal.replay().await?;
        let mut replayed = 0usize;

        for record in records {
            let hash = record.entry.id_hash;
            if let Some(location) = self.tree.latest().get_latest_by_hash(hash) {
                if location.epoch >= record.epoch {
                    continue;
                }
            }
            let msg = Message {
                op: record.op,
                entry: record.entry,
                epoch: record.epoch,
                timestamp: record.timestamp,
            };
            self.tree.apply(msg, self.append_deadline).await?;
            replayed += 1;
        }

        // Even when nothing replays, future appends must continue the clock
        self.tree.observe_epoch(self.wal.current_epoch());
        Ok(replayed)
    }

    /// Insert a new vector entry; returns the committed epoch
    pub async fn insert(&self, entry: VectorEntry) -> Result<Epoch> {
        self.write(OpKind::Insert, entry).await
    }

    /// Insert or overwrite a vector entry; returns the committed epoch
    pub async fn upsert(&self, entry: VectorEntry) -> Result<Epoch> {
        self.write(OpKind::Upsert, entry).await
    }

    /// Tombstone an identity; returns the committed epoch
    pub async fn delete(&self, id: VectorId) -> Result<Epoch> {
        if id.is_empty() {
            return Err(SiltError::invalid_input("vector id must not be empty"));
        }
        self.write(OpKind::Delete, VectorEntry::tombstone(id)).await
    }

    async fn write(&self, op: OpKind, entry: VectorEntry) -> Result<Epoch> {
        self.validate_entry(op, &entry)?;

        // Admission control before the WAL commit: a record that cannot enter
        // the buffer should not be logged in the first place
        if !self
            .tree
            .buffer()
            .wait_for_space(self.append_deadline)
            .await
        {
            return Err(SiltError::BufferFull);
        }

        let epoch = {
            let _guard = self.commit_lock.lock().await;
            let (epoch, timestamp) = self.wal.append(op, &entry).await?;
            let msg = Message {
                op,
                entry,
                epoch,
                timestamp,
            };
            self.tree.accept(msg, self.append_deadline).await?;
            epoch
        };

        // Threshold flushes run outside the commit section so a slow segment
        // encode never stalls other writers
        self.tree.maybe_flush().await?;
        Ok(epoch)
    }

    fn validate_entry(&self, op: OpKind, entry: &VectorEntry) -> Result<()> {
        if entry.id.is_empty() {
            return Err(SiltError::invalid_input("vector id must not be empty"));
        }
        if entry.tags.len() > MAX_TAGS_PER_ENTRY {
            return Err(SiltError::invalid_input(format!(
                "entry carries {} tags, limit is {MAX_TAGS_PER_ENTRY}",
                entry.tags.len()
            )));
        }
        if op != OpKind::Delete && entry.vector.len() != self.config.collection.dim {
            return Err(SiltError::DimensionMismatch {
                expected: self.config.collection.dim,
                actual: entry.vector.len(),
            });
        }
        Ok(())
    }

    /// The buffer's unranked contribution to a query
    pub fn scan_buffer(&self, filter: &QueryFilter, max_scan: usize) -> Vec<VectorEntry> {
        self.tree.buffer().scan_for_query(filter, max_scan)
    }

    /// Convenience scan filtered by tenant/namespace/tags
    pub fn scan(
        &self,
        tenant: &str,
        namespace: &str,
        tags_any: &[TagId],
        max_scan: usize,
    ) -> Vec<VectorEntry> {
        let filter = QueryFilter {
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            tags_any: tags_any.to_vec(),
        };
        self.scan_buffer(&filter, max_scan)
    }

    /// Authoritative location of an identity, tombstones included
    pub fn get_latest(&self, id: &VectorId) -> Option<VectorLocation> {
        self.tree.latest().get_latest(id)
    }

    /// True iff the identity exists and is not tombstoned
    pub fn exists(&self, id: &VectorId) -> bool {
        self.tree.latest().exists(id)
    }

    /// Run flush passes; `force` drains the buffer completely
    pub async fn flush(&self, force: bool) -> Result<FlushOutcome> {
        self.tree.flush(force).await
    }

    /// Drop every map entry resident in `segment_id` and commit its removal
    /// from the manifest; the hook compaction calls after rewriting segments
    pub async fn retire_segment(&self, segment_id: &str) -> Result<()> {
        self.tree.latest().remove_segment_entries(segment_id);
        self.manifest
            .commit_remove(&[segment_id.to_string()])
            .await?;
        let snapshot = self.manifest.snapshot();
        self.tree.rebind_segments(&snapshot.segments);
        Ok(())
    }

    /// Snapshot of the manifest's active segments
    pub fn manifest(&self) -> Manifest {
        self.manifest.snapshot()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            buffer: self.tree.buffer().stats(),
            map: self.tree.latest().stats(),
            tree: self.tree.stats(),
            wal_epoch: self.wal.current_epoch(),
            manifest_generation: self.manifest.generation(),
            segment_count: self.manifest.segment_count(),
        }
    }
}

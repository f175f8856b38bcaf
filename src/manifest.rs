//! Segment manifest
//!
//! The generation-numbered list of active segments. Committing the manifest
//! is the commit point of a flush: a segment file that exists on disk but is
//! absent from the manifest is garbage and is never consulted by recovery.
//! Commits write a temp file, fsync it, and rename over the old manifest.

use crate::defaults::MANIFEST_FILE_NAME;
use crate::error::{Result, SiltError};
use crate::types::SegmentDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durable list of active segments with a monotone generation number
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    pub segments: Vec<SegmentDescriptor>,
}

impl Manifest {
    pub fn contains(&self, segment_id: &str) -> bool {
        self.segments.iter().any(|s| s.segment_id == segment_id)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// Reads and atomically replaces the on-disk manifest
pub struct ManifestStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join(MANIFEST_FILE_NAME),
            tmp_path: dir.join(format!("{MANIFEST_FILE_NAME}.tmp")),
        }
    }

    /// Load the current manifest; `None` on a fresh directory
    pub async fn load(&self) -> Result<Option<Manifest>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => {
                let manifest = serde_json::from_slice(&data)
                    .map_err(|e| SiltError::serialization(e.to_string()))?;
                Ok(Some(manifest))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Durably replace the manifest: write temp, fsync, rename, fsync dir
    pub async fn commit(&self, manifest: &Manifest) -> Result<()> {
        let data = serde_json::to_vec_pretty(manifest)
            .map_err(|e| SiltError::serialization(e.to_string()))?;

        tokio::fs::write(&self.tmp_path, &data).await?;
        let f = tokio::fs::File::open(&self.tmp_path).await?;
        f.sync_all().await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        if let Some(dir) = self.path.parent() {
            std::fs::File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}

/// In-memory manifest state shared by the flush path
///
/// Mutations happen only inside the tree's serialized flush protocol; the
/// lock here is for cheap concurrent reads of the current segment set.
pub struct ManifestState {
    current: Mutex<Manifest>,
    store: ManifestStore,
}

impl ManifestState {
    pub fn new(initial: Manifest, store: ManifestStore) -> Self {
        Self {
            current: Mutex::new(initial),
            store,
        }
    }

    pub fn snapshot(&self) -> Manifest {
        self.current.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.lock().generation
    }

    pub fn segment_count(&self) -> usize {
        self.current.lock().segment_count()
    }

    /// Commit a new segment: bump the generation, persist, then publish
    ///
    /// The in-memory state is replaced only after the store commit succeeds,
    /// so a failed commit leaves no trace of the segment.
    pub async fn commit_add(&self, descriptor: SegmentDescriptor) -> Result<()> {
        let mut next = self.snapshot();
        next.generation += 1;
        next.segments.push(descriptor);

        self.store.commit(&next).await?;
        *self.current.lock() = next;
        Ok(())
    }

    /// Commit the removal of compacted-away segments
    pub async fn commit_remove(&self, segment_ids: &[String]) -> Result<()> {
        let mut next = self.snapshot();
        next.generation += 1;
        next.segments
            .retain(|s| !segment_ids.iter().any(|id| id == &s.segment_id));

        self.store.commit(&next).await?;
        *self.current.lock() = next;
        Ok(())
    }
}

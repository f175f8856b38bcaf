//! Mock segment encoder for local development and tests
//!
//! Persists descriptors and row tables as JSON files under a root directory,
//! with configurable latency and failure injection. Vector payloads are not
//! retained; the write path only needs the row table back at recovery.

use super::{row_table_for_batch, SegmentEncoder};
use crate::error::{Result, SiltError};
use crate::types::{now_micros, Message, OpKind, SegmentDescriptor, SegmentRow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Configuration for mock encoder behavior
#[derive(Debug, Clone)]
pub struct MockEncoderConfig {
    /// Simulated encode latency per call
    pub encode_latency: Duration,
    /// Probability in [0, 1] that an encode fails
    pub failure_rate: f64,
}

impl Default for MockEncoderConfig {
    fn default() -> Self {
        Self {
            encode_latency: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

impl MockEncoderConfig {
    /// Config for fast tests (no latency, no failures)
    pub fn fast() -> Self {
        Self::default()
    }

    /// Config simulating a slow, flaky disk
    pub fn flaky(failure_rate: f64) -> Self {
        Self {
            encode_latency: Duration::from_millis(2),
            failure_rate,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SegmentFile {
    descriptor: SegmentDescriptor,
    rows: Vec<SegmentRow>,
}

/// Filesystem-backed mock encoder
pub struct MockSegmentEncoder {
    root: PathBuf,
    config: MockEncoderConfig,
    /// Deterministic failure injection: the next N encodes fail
    inject_failures: AtomicUsize,
    encode_count: AtomicUsize,
}

impl MockSegmentEncoder {
    pub fn new(root: impl Into<PathBuf>, config: MockEncoderConfig) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            config,
            inject_failures: AtomicUsize::new(0),
            encode_count: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` encode calls fail deterministically
    pub fn inject_failures(&self, n: usize) {
        self.inject_failures.store(n, Ordering::SeqCst);
    }

    /// Number of successful encode calls so far
    pub fn encode_count(&self) -> usize {
        self.encode_count.load(Ordering::SeqCst)
    }

    fn segment_path(&self, segment_id: &str) -> PathBuf {
        self.root.join(format!("{segment_id}.seg.json"))
    }

    fn should_fail(&self) -> bool {
        let mut pending = self.inject_failures.load(Ordering::SeqCst);
        while pending > 0 {
            match self.inject_failures.compare_exchange(
                pending,
                pending - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => pending = observed,
            }
        }
        self.config.failure_rate > 0.0 && rand::random::<f64>() < self.config.failure_rate
    }
}

#[async_trait]
impl SegmentEncoder for MockSegmentEncoder {
    async fn encode_segment(&self, messages: &[Message]) -> Result<SegmentDescriptor> {
        if !self.config.encode_latency.is_zero() {
            sleep(self.config.encode_latency).await;
        }
        if self.should_fail() {
            return Err(SiltError::flush_failed("mock encoder failure injected"));
        }
        if messages.is_empty() {
            return Err(SiltError::flush_failed("cannot encode an empty batch"));
        }

        let segment_id = Uuid::now_v7().to_string();
        let path = self.segment_path(&segment_id);

        let tombstones = messages.iter().filter(|m| m.op == OpKind::Delete).count();
        let descriptor = SegmentDescriptor {
            segment_id: segment_id.clone(),
            file_path: path.clone(),
            num_vectors: messages.len() as u64,
            min_id_hash: messages.iter().map(|m| m.entry.id_hash).min().unwrap_or(0),
            max_id_hash: messages.iter().map(|m| m.entry.id_hash).max().unwrap_or(0),
            min_epoch: messages.iter().map(|m| m.epoch).min().unwrap_or(0),
            max_epoch: messages.iter().map(|m| m.epoch).max().unwrap_or(0),
            tombstone_ratio: tombstones as f32 / messages.len() as f32,
            created_at: now_micros(),
            is_stable: false,
        };

        let file = SegmentFile {
            descriptor: descriptor.clone(),
            rows: row_table_for_batch(messages),
        };
        let data = serde_json::to_vec(&file).map_err(|e| SiltError::serialization(e.to_string()))?;

        tokio::fs::write(&path, &data).await?;
        let f = tokio::fs::File::open(&path).await?;
        f.sync_all().await?;
        sync_dir(&self.root)?;

        self.encode_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(segment_id = %segment_id, rows = messages.len(), "mock segment encoded");
        Ok(descriptor)
    }

    async fn read_row_table(&self, descriptor: &SegmentDescriptor) -> Result<Vec<SegmentRow>> {
        let data = tokio::fs::read(self.segment_path(&descriptor.segment_id)).await?;
        let file: SegmentFile =
            serde_json::from_slice(&data).map_err(|e| SiltError::serialization(e.to_string()))?;
        Ok(file.rows)
    }
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

//! Sharded in-memory message buffer
//!
//! Absorbs write bursts ahead of the B-epsilon tree. Each shard serializes
//! its own appends behind a short-held mutex; different shards proceed in
//! parallel. Shard assignment is stable (`hash % shard_count`), so all
//! messages for one identity live in one shard and drain in FIFO order.
//!
//! Deduplication is visibility-only: a re-written identity keeps its older
//! messages in the FIFO (they still flush), but the shard's dedup index
//! records the surviving epoch so scans return only the latest version.

use crate::config::BufferConfig;
use crate::error::{Result, SiltError};
use crate::latest::LatestByIdMap;
use crate::types::{
    HashRange, IdHash, Message, OpKind, QueryFilter, VectorEntry, VectorLocation,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::defaults::MESSAGE_OVERHEAD_BYTES;

struct ShardInner {
    queue: VecDeque<Message>,
    /// Identity hash -> epoch of the most recent message for that identity
    dedup: HashMap<IdHash, u64>,
    bytes: usize,
    count: usize,
}

struct Shard {
    inner: Mutex<ShardInner>,
}

impl Shard {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ShardInner {
                queue: VecDeque::new(),
                dedup: HashMap::new(),
                bytes: 0,
                count: 0,
            }),
        }
    }
}

/// Snapshot of buffer occupancy
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub message_count: usize,
    pub bytes_used: usize,
    pub dedupe_count: usize,
    pub shard_sizes: Vec<usize>,
}

/// Sharded write buffer with per-identity dedup and fullness backpressure
pub struct MessageBuffer {
    config: BufferConfig,
    shards: Vec<Shard>,
    latest_by_id: Arc<LatestByIdMap>,

    total_bytes: AtomicUsize,
    total_messages: AtomicUsize,
    dedupe_count: AtomicUsize,

    space_notify: Notify,
}

impl MessageBuffer {
    pub fn new(config: BufferConfig, latest_by_id: Arc<LatestByIdMap>) -> Self {
        let shards = (0..config.shard_count).map(|_| Shard::new()).collect();
        tracing::info!(
            shards = config.shard_count,
            max_bytes = config.max_bytes,
            "message buffer initialized"
        );
        Self {
            config,
            shards,
            latest_by_id,
            total_bytes: AtomicUsize::new(0),
            total_messages: AtomicUsize::new(0),
            dedupe_count: AtomicUsize::new(0),
            space_notify: Notify::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.config.shard_count
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn message_count(&self) -> usize {
        self.total_messages.load(Ordering::Acquire)
    }

    pub fn is_over_flush_threshold(&self) -> bool {
        self.total_bytes() >= self.config.flush_threshold_bytes
    }

    #[inline]
    fn shard_index(&self, hash: IdHash) -> usize {
        (hash % self.config.shard_count as u64) as usize
    }

    /// Estimated in-memory footprint of a message
    ///
    /// Accuracy matters only for fairness of backpressure, not correctness.
    pub fn estimate_size(msg: &Message) -> usize {
        MESSAGE_OVERHEAD_BYTES
            + msg.entry.vector.len() * std::mem::size_of::<f32>()
            + msg.entry.id.len()
            + msg.entry.tenant.len()
            + msg.entry.namespace.len()
            + msg.entry.tags.len() * std::mem::size_of::<u32>()
    }

    /// Append a committed message to its shard
    ///
    /// Blocks up to `deadline` waiting for capacity; on expiry returns
    /// [`SiltError::BufferFull`] without inserting. On success the
    /// latest-by-id map is updated with a buffer (or tombstone) location.
    pub async fn append(&self, hash: IdHash, msg: Message, deadline: Duration) -> Result<()> {
        let size = Self::estimate_size(&msg);
        self.reserve(size, deadline).await?;

        let shard = &self.shards[self.shard_index(hash)];
        {
            let mut inner = shard.inner.lock();
            if self.config.dedupe_enabled {
                if msg.op != OpKind::Delete && inner.dedup.contains_key(&hash) {
                    self.dedupe_count.fetch_add(1, Ordering::Relaxed);
                }
                inner.dedup.insert(hash, msg.epoch);
            }
            inner.bytes += size;
            inner.count += 1;
            inner.queue.push_back(msg.clone());
            self.total_messages.fetch_add(1, Ordering::Release);
        }

        let location = match msg.op {
            OpKind::Delete => VectorLocation::deleted(msg.timestamp, msg.epoch),
            _ => VectorLocation::buffer(msg.timestamp, msg.epoch),
        };
        self.latest_by_id.upsert(msg.entry.id, hash, location);

        Ok(())
    }

    /// Reserve `size` bytes against the global cap, waiting up to `deadline`
    async fn reserve(&self, size: usize, deadline: Duration) -> Result<()> {
        let expires = Instant::now() + deadline;
        loop {
            if self.try_reserve(size) {
                return Ok(());
            }

            let now = Instant::now();
            if now >= expires {
                tracing::warn!(
                    bytes = self.total_bytes(),
                    max_bytes = self.config.max_bytes,
                    "append deadline expired while buffer full"
                );
                return Err(SiltError::BufferFull);
            }

            // Register for the wakeup before re-checking, so an evict between
            // the check and the await cannot be missed
            let notified = self.space_notify.notified();
            if self.try_reserve(size) {
                return Ok(());
            }
            if tokio::time::timeout(expires - now, notified).await.is_err() {
                return Err(SiltError::BufferFull);
            }
        }
    }

    fn try_reserve(&self, size: usize) -> bool {
        let mut current = self.total_bytes.load(Ordering::Acquire);
        loop {
            if current + size > self.config.max_bytes {
                return false;
            }
            match self.total_bytes.compare_exchange_weak(
                current,
                current + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Copy up to `max_batch` messages routed to the given leaf range
    ///
    /// Shards are walked round-robin starting at `leaf_id % shard_count`;
    /// within a shard, messages are taken head-first, so the returned batch
    /// preserves FIFO order per identity. Messages are copied, not removed;
    /// eviction happens only after the segment is durable.
    pub fn slice_for_leaf(&self, leaf_id: u64, range: &HashRange, max_batch: usize) -> Vec<Message> {
        let mut batch = Vec::new();
        let shard_count = self.config.shard_count;
        let start = (leaf_id % shard_count as u64) as usize;

        for offset in 0..shard_count {
            if batch.len() >= max_batch {
                break;
            }
            let shard = &self.shards[(start + offset) % shard_count];
            let inner = shard.inner.lock();
            for msg in inner.queue.iter() {
                if batch.len() >= max_batch {
                    break;
                }
                if range.contains(msg.entry.id_hash) {
                    batch.push(msg.clone());
                }
            }
        }

        batch
    }

    /// Remove flushed messages from their shards and release their bytes
    ///
    /// Each flushed message removes the oldest queue entry with the same
    /// identity hash and epoch. The dedup index entry is cleared only when it
    /// still points at the evicted message (no intervening append).
    pub fn evict(&self, flushed: &[Message]) {
        let mut released = 0usize;

        for msg in flushed {
            let hash = msg.entry.id_hash;
            let shard = &self.shards[self.shard_index(hash)];
            let mut inner = shard.inner.lock();

            let position = inner
                .queue
                .iter()
                .position(|m| m.entry.id_hash == hash && m.epoch == msg.epoch);
            let Some(position) = position else {
                continue;
            };
            let Some(removed) = inner.queue.remove(position) else {
                continue;
            };
            let size = Self::estimate_size(&removed);
            inner.bytes -= size;
            inner.count -= 1;
            released += size;
            self.total_messages.fetch_sub(1, Ordering::Release);

            if let Some(&latest_epoch) = inner.dedup.get(&hash) {
                if latest_epoch == removed.epoch {
                    inner.dedup.remove(&hash);
                }
            }
        }

        if released > 0 {
            self.total_bytes.fetch_sub(released, Ordering::Release);
            self.space_notify.notify_waiters();
        }
    }

    /// Scan buffered entries matching the filter, for the read path
    ///
    /// Examines up to `max_scan` messages across all shards. Deletes are
    /// skipped, shadowed versions of a deduplicated identity are suppressed,
    /// and tenant/namespace/tag filters are applied in that order. No ranking
    /// happens here; the caller blends these with segment results.
    pub fn scan_for_query(&self, filter: &QueryFilter, max_scan: usize) -> Vec<VectorEntry> {
        let mut results = Vec::new();
        let mut scanned = 0usize;

        for shard in &self.shards {
            if scanned >= max_scan {
                break;
            }
            let inner = shard.inner.lock();
            for msg in inner.queue.iter() {
                if scanned >= max_scan {
                    break;
                }
                scanned += 1;

                if msg.op == OpKind::Delete {
                    continue;
                }
                if self.config.dedupe_enabled {
                    // Shadowed by a newer buffered write for the same identity
                    if let Some(&latest_epoch) = inner.dedup.get(&msg.entry.id_hash) {
                        if latest_epoch != msg.epoch {
                            continue;
                        }
                    }
                }
                if !filter.tenant.is_empty() && msg.entry.tenant != filter.tenant {
                    continue;
                }
                if !filter.namespace.is_empty() && msg.entry.namespace != filter.namespace {
                    continue;
                }
                if !filter.tags_any.is_empty()
                    && !msg.entry.tags.iter().any(|t| filter.tags_any.contains(t))
                {
                    continue;
                }

                results.push(msg.entry.clone());
            }
        }

        results
    }

    /// Per-range byte occupancy, used by the tree's flush selection
    pub fn bytes_in_ranges(&self, ranges: &[HashRange]) -> Vec<usize> {
        let mut totals = vec![0usize; ranges.len()];
        for shard in &self.shards {
            let inner = shard.inner.lock();
            for msg in inner.queue.iter() {
                if let Some(i) = ranges.iter().position(|r| r.contains(msg.entry.id_hash)) {
                    totals[i] += Self::estimate_size(msg);
                }
            }
        }
        totals
    }

    /// Block until usage drops below the cap or the timeout elapses
    pub async fn wait_for_space(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.space_notify.notified();
                if self.total_bytes.load(Ordering::Acquire) < self.config.max_bytes {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Administrative reset for recovery; drops all shards
    pub fn clear(&self) {
        let mut released = 0usize;
        for shard in &self.shards {
            let mut inner = shard.inner.lock();
            released += inner.bytes;
            self.total_messages.fetch_sub(inner.count, Ordering::Release);
            inner.queue.clear();
            inner.dedup.clear();
            inner.bytes = 0;
            inner.count = 0;
        }
        self.total_bytes.fetch_sub(released, Ordering::Release);
        self.dedupe_count.store(0, Ordering::Relaxed);
        self.space_notify.notify_waiters();
    }

    /// Snapshot message count, byte usage, dedup count, and shard sizes
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            message_count: self.total_messages.load(Ordering::Acquire),
            bytes_used: self.total_bytes.load(Ordering::Acquire),
            dedupe_count: self.dedupe_count.load(Ordering::Relaxed),
            shard_sizes: self
                .shards
                .iter()
                .map(|s| s.inner.lock().count)
                .collect(),
        }
    }
}

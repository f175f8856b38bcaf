//! B-epsilon tree: the routing and flushing structure of the write path
//!
//! Messages physically live in the sharded [`MessageBuffer`]; the tree routes
//! over them by identity hash. Internal nodes split their byte budget between
//! pivots and buffered messages according to epsilon, and a flush pass
//! descends fullest-first from the root until it reaches a leaf, whose
//! buffered messages are handed to the segment encoder.
//!
//! Flush protocol (the critical section):
//! 1. snapshot the leaf's messages via `slice_for_leaf` (copy, not remove)
//! 2. encoder writes a durable segment and returns its descriptor
//! 3. manifest commit, the commit point; a failure here leaves buffer and
//!    map untouched and orphans only the segment file
//! 4. evict the batch from the buffer, reassign locations in the map
//!
//! A failed encode is absorbed: logged, counted, and retried by the next
//! flush pass, giving at-least-once flush semantics.

mod node;

use crate::buffer::MessageBuffer;
use crate::config::BTreeConfig;
use crate::error::{Result, SiltError};
use crate::latest::{LatestByIdMap, SegmentAssignment};
use crate::manifest::ManifestState;
use crate::segment::SegmentEncoder;
use crate::types::{Epoch, HashRange, Message, SegmentDescriptor};
use node::{Node, NodeId, NodeKind};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::defaults::{FLUSH_STALL_LIMIT, MIN_FLUSH_REDUCTION};

/// Aggregate result of a flush invocation
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlushOutcome {
    pub leaves_flushed: usize,
    pub messages_flushed: usize,
    pub segments: Vec<String>,
    pub failed: usize,
}

/// Snapshot of tree shape and flush activity
#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub leaf_nodes: usize,
    pub messages_buffered: usize,
    pub bytes_buffered: usize,
    pub avg_fill_ratio: f32,
    pub flush_count: u64,
    pub failed_flush_count: u64,
    pub epsilon: f32,
}

struct Tuning {
    epsilon: f32,
    stalled_flushes: u32,
}

enum PassResult {
    Flushed { count: usize, segment: String },
    Failed,
    Nothing,
}

/// Write-optimized B-epsilon tree over the message buffer
///
/// Owns the buffer and the latest-by-id map (wired at construction), plus
/// handles to the external segment encoder and the manifest.
pub struct BEpsilonTree {
    config: BTreeConfig,
    buffer: Arc<MessageBuffer>,
    latest: Arc<LatestByIdMap>,
    encoder: Arc<dyn SegmentEncoder>,
    manifest: Arc<ManifestState>,

    nodes: RwLock<HashMap<NodeId, Arc<RwLock<Node>>>>,
    root: NodeId,
    next_node_id: AtomicU64,

    /// Highest epoch accepted; the WAL contract requires strictly greater
    last_epoch: AtomicU64,
    flush_count: AtomicU64,
    failed_flush_count: AtomicU64,

    tuning: Mutex<Tuning>,
    /// Serializes flush passes; epsilon is retuned only at flush boundaries
    flush_lock: tokio::sync::Mutex<()>,
}

impl BEpsilonTree {
    pub fn new(
        config: BTreeConfig,
        buffer: Arc<MessageBuffer>,
        latest: Arc<LatestByIdMap>,
        encoder: Arc<dyn SegmentEncoder>,
        manifest: Arc<ManifestState>,
    ) -> Self {
        let initial_leaves = buffer.shard_count().clamp(1, config.fanout);
        let mut nodes = HashMap::new();

        let root: NodeId = 0;
        let mut children = Vec::with_capacity(initial_leaves);
        let mut pivots = Vec::with_capacity(initial_leaves.saturating_sub(1));
        for i in 0..initial_leaves {
            let id = (i + 1) as NodeId;
            let range = even_partition(i, initial_leaves);
            if i + 1 < initial_leaves {
                pivots.push(range.hi);
            }
            children.push(id);
            nodes.insert(
                id,
                Arc::new(RwLock::new(Node::leaf(Some(root), range))),
            );
        }
        nodes.insert(
            root,
            Arc::new(RwLock::new(Node::internal(
                None,
                HashRange::FULL,
                pivots,
                children,
            ))),
        );

        let epsilon = config.epsilon;
        tracing::info!(
            leaves = initial_leaves,
            epsilon,
            fanout = config.fanout,
            "b-epsilon tree initialized"
        );

        Self {
            config,
            buffer,
            latest,
            encoder,
            manifest,
            nodes: RwLock::new(nodes),
            root,
            next_node_id: AtomicU64::new(initial_leaves as u64 + 1),
            last_epoch: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            failed_flush_count: AtomicU64::new(0),
            tuning: Mutex::new(Tuning {
                epsilon,
                stalled_flushes: 0,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Shared handles, for callers that need direct buffer/map access
    pub fn buffer(&self) -> &Arc<MessageBuffer> {
        &self.buffer
    }

    pub fn latest(&self) -> &Arc<LatestByIdMap> {
        &self.latest
    }

    /// Accept a WAL-committed message into the write path
    ///
    /// The message's epoch must be strictly greater than any previously
    /// accepted; a violation is fatal. Callers must hand messages over in
    /// epoch order (the engine's commit section guarantees this). On success
    /// the message is buffered and the latest-by-id map is updated.
    pub async fn accept(&self, msg: Message, deadline: Duration) -> Result<()> {
        let epoch = msg.epoch;
        let prev = self.last_epoch.fetch_max(epoch, Ordering::SeqCst);
        if prev >= epoch {
            return Err(SiltError::invariant(format!(
                "epoch {epoch} not greater than last committed epoch {prev}"
            )));
        }

        self.buffer.append(msg.entry.id_hash, msg, deadline).await
    }

    /// Run an opportunistic flush pass when the soft threshold is exceeded
    pub async fn maybe_flush(&self) -> Result<FlushOutcome> {
        if self.buffer.is_over_flush_threshold() {
            self.flush(false).await
        } else {
            Ok(FlushOutcome::default())
        }
    }

    /// [`accept`](Self::accept) followed by a threshold-triggered flush pass
    pub async fn apply(&self, msg: Message, deadline: Duration) -> Result<()> {
        self.accept(msg, deadline).await?;
        self.maybe_flush().await?;
        Ok(())
    }

    /// Seed the epoch clock during recovery
    pub fn observe_epoch(&self, epoch: Epoch) {
        self.last_epoch.fetch_max(epoch, Ordering::SeqCst);
    }

    /// Run flush passes
    ///
    /// `force = true` drains the buffer completely (stopping only on an
    /// encoder failure); `force = false` runs a single opportunistic pass and
    /// is a no-op when another flush is already in progress.
    pub async fn flush(&self, force: bool) -> Result<FlushOutcome> {
        if force {
            let _guard = self.flush_lock.lock().await;
            self.flush_locked(true).await
        } else {
            match self.flush_lock.try_lock() {
                Ok(_guard) => self.flush_locked(false).await,
                Err(_) => Ok(FlushOutcome::default()),
            }
        }
    }

    async fn flush_locked(&self, force: bool) -> Result<FlushOutcome> {
        let mut outcome = FlushOutcome::default();
        loop {
            match self.flush_pass(force).await? {
                PassResult::Flushed { count, segment } => {
                    outcome.leaves_flushed += 1;
                    outcome.messages_flushed += count;
                    outcome.segments.push(segment);
                    if !force || self.buffer.message_count() == 0 {
                        break;
                    }
                }
                PassResult::Failed => {
                    outcome.failed += 1;
                    break;
                }
                PassResult::Nothing => break,
            }
        }
        Ok(outcome)
    }

    /// Descend from the root to the flush target and flush it
    async fn flush_pass(&self, force: bool) -> Result<PassResult> {
        let epsilon = self.tuning.lock().epsilon;
        let mut node_id = self.root;
        let mut direct = false;

        loop {
            enum Step {
                Leaf(HashRange),
                Descend(Vec<NodeId>, Vec<HashRange>),
            }
            let node_arc = self.node(node_id)?;
            let step = {
                let guard = node_arc.read();
                match &guard.kind {
                    NodeKind::Leaf { .. } => Step::Leaf(guard.range),
                    NodeKind::Internal { children, .. } => {
                        Step::Descend(children.clone(), guard.child_ranges())
                    }
                }
            };
            let (children, ranges) = match step {
                Step::Leaf(range) => return self.flush_leaf(node_id, range).await,
                Step::Descend(children, ranges) => (children, ranges),
            };

            let bytes = self.buffer.bytes_in_ranges(&ranges);
            let total: usize = bytes.iter().sum();
            if total == 0 {
                return Ok(PassResult::Nothing);
            }

            // Fullest-first, ties broken by lowest child index
            let mut selected = 0;
            for (i, &b) in bytes.iter().enumerate() {
                if b > bytes[selected] {
                    selected = i;
                }
            }
            let share = bytes[selected] as f32 / total as f32;
            let hot = self.config.adaptive_epsilon && share >= self.config.hot_partition_threshold;

            if !force && !direct && !hot {
                let budget = self.per_child_budget(children.len(), epsilon);
                if bytes[selected] < budget && !self.buffer.is_over_flush_threshold() {
                    return Ok(PassResult::Nothing);
                }
            }

            // A dominant child bypasses the level-by-level cascade: descend
            // straight through to its fullest destination leaf
            if self.config.adaptive_epsilon && share >= self.config.direct_flush_threshold {
                direct = true;
            }

            node_id = children[selected];
        }
    }

    async fn flush_leaf(&self, leaf_id: NodeId, range: HashRange) -> Result<PassResult> {
        let batch = self
            .buffer
            .slice_for_leaf(leaf_id, &range, self.config.max_flush_batch);
        if batch.is_empty() {
            return Ok(PassResult::Nothing);
        }
        let bytes_before = self.buffer.total_bytes();

        let descriptor = match self.encoder.encode_segment(&batch).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.failed_flush_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    leaf = leaf_id,
                    messages = batch.len(),
                    error = %e,
                    "segment encode failed, flush will be retried"
                );
                return Ok(PassResult::Failed);
            }
        };

        // Commit point: once the manifest references the segment, eviction
        // and location reassignment may proceed. A failure here orphans only
        // the segment file; buffer and map stay untouched.
        if let Err(e) = self.manifest.commit_add(descriptor.clone()).await {
            self.failed_flush_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                segment_id = %descriptor.segment_id,
                error = %e,
                "manifest commit failed, flush will be retried"
            );
            return Ok(PassResult::Failed);
        }

        self.buffer.evict(&batch);

        let assignments: Vec<SegmentAssignment> = batch
            .iter()
            .enumerate()
            .map(|(i, msg)| SegmentAssignment {
                id_hash: msg.entry.id_hash,
                local_row: i as u32,
                epoch: msg.epoch,
            })
            .collect();
        self.latest
            .move_to_segment(&assignments, &descriptor.segment_id);

        let segment_id = descriptor.segment_id.clone();
        self.bind_segment_to_leaf(leaf_id, descriptor)?;
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.note_flush_effectiveness(bytes_before);

        tracing::info!(
            leaf = leaf_id,
            segment_id = %segment_id,
            messages = batch.len(),
            "leaf flushed to segment"
        );

        Ok(PassResult::Flushed {
            count: batch.len(),
            segment: segment_id,
        })
    }

    /// Bind a committed segment to its leaf, splitting the leaf range when
    /// it has accumulated too many segments
    fn bind_segment_to_leaf(&self, leaf_id: NodeId, descriptor: SegmentDescriptor) -> Result<()> {
        let split_needed = {
            let leaf_arc = self.node(leaf_id)?;
            let mut guard = leaf_arc.write();
            let leaf = &mut *guard;
            let NodeKind::Leaf { segments } = &mut leaf.kind else {
                return Err(SiltError::invariant(format!(
                    "flush target {leaf_id} is not a leaf"
                )));
            };
            segments.push(descriptor);
            segments.len() > self.config.max_segments_per_leaf && leaf.range.lo < leaf.range.hi
        };

        if split_needed {
            self.split_leaf(leaf_id)?;
        }
        Ok(())
    }

    /// Split a leaf's hash range at its midpoint, if parent fanout allows
    fn split_leaf(&self, leaf_id: NodeId) -> Result<()> {
        let epsilon = self.tuning.lock().epsilon;
        let fanout_limit = self.effective_fanout(epsilon);

        let mut nodes = self.nodes.write();
        let leaf_arc = nodes
            .get(&leaf_id)
            .cloned()
            .ok_or_else(|| SiltError::invariant(format!("unknown leaf {leaf_id}")))?;
        let mut leaf_guard = leaf_arc.write();
        let leaf = &mut *leaf_guard;

        let Some(parent_id) = leaf.parent else {
            return Ok(());
        };
        let parent_arc = nodes
            .get(&parent_id)
            .cloned()
            .ok_or_else(|| SiltError::invariant(format!("unknown parent {parent_id}")))?;
        let mut parent_guard = parent_arc.write();
        let NodeKind::Internal { pivots, children } = &mut parent_guard.kind else {
            return Err(SiltError::invariant("leaf parent is not internal".to_string()));
        };
        if children.len() >= fanout_limit {
            // TODO: split internal nodes once leaf fanout is exhausted
            return Ok(());
        }

        let mid = leaf.range.midpoint();
        let left_range = HashRange::new(leaf.range.lo, mid);
        let right_range = HashRange::new(mid + 1, leaf.range.hi);
        let right_id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        leaf.range = left_range;

        let NodeKind::Leaf { segments } = &mut leaf.kind else {
            return Ok(());
        };
        let right_segments: Vec<SegmentDescriptor> = segments
            .iter()
            .filter(|s| right_range.overlaps(s.min_id_hash, s.max_id_hash))
            .cloned()
            .collect();
        segments.retain(|s| left_range.overlaps(s.min_id_hash, s.max_id_hash));

        let mut right = Node::leaf(Some(parent_id), right_range);
        if let NodeKind::Leaf { segments } = &mut right.kind {
            *segments = right_segments;
        }

        let position = children
            .iter()
            .position(|&c| c == leaf_id)
            .ok_or_else(|| SiltError::invariant("leaf missing from parent".to_string()))?;
        pivots.insert(position, mid);
        children.insert(position + 1, right_id);

        tracing::debug!(
            leaf = leaf_id,
            right = right_id,
            pivot = mid,
            "leaf range split"
        );
        nodes.insert(right_id, Arc::new(RwLock::new(right)));
        Ok(())
    }

    /// Rebind recovered segments to the leaves covering their hash ranges
    pub fn rebind_segments(&self, descriptors: &[SegmentDescriptor]) {
        let nodes = self.nodes.read();
        for node_arc in nodes.values() {
            let mut node = node_arc.write();
            let range = node.range;
            if let NodeKind::Leaf { segments } = &mut node.kind {
                *segments = descriptors
                    .iter()
                    .filter(|d| range.overlaps(d.min_id_hash, d.max_id_hash))
                    .cloned()
                    .collect();
            }
        }
    }

    /// Per-child message budget inside a node: epsilon carves the node size
    /// into pivot space and buffer space
    fn per_child_budget(&self, child_count: usize, epsilon: f32) -> usize {
        let node_size = self.config.node_size_bytes;
        let pivot_bytes = (node_size as f32).powf(epsilon) as usize;
        let buffer_bytes = node_size.saturating_sub(pivot_bytes).max(node_size / 4);
        buffer_bytes / child_count.max(1)
    }

    fn effective_fanout(&self, epsilon: f32) -> usize {
        let by_epsilon = (self.config.node_size_bytes as f32).powf(epsilon) as usize;
        by_epsilon.clamp(2, self.config.fanout)
    }

    /// Track flush effectiveness and retune epsilon at flush boundaries
    fn note_flush_effectiveness(&self, bytes_before: usize) {
        let bytes_after = self.buffer.total_bytes();
        let reduced = bytes_before.saturating_sub(bytes_after) as f32;
        let effective =
            bytes_before == 0 || reduced / bytes_before as f32 >= MIN_FLUSH_REDUCTION;

        let mut tuning = self.tuning.lock();
        if effective {
            tuning.stalled_flushes = 0;
            return;
        }
        tuning.stalled_flushes += 1;
        if self.config.adaptive_epsilon && tuning.stalled_flushes >= FLUSH_STALL_LIMIT {
            let lowered = (tuning.epsilon * 0.9).max(self.config.epsilon_min);
            if lowered < tuning.epsilon {
                tracing::debug!(
                    epsilon = lowered,
                    "consecutive ineffective flushes, epsilon lowered"
                );
                tuning.epsilon = lowered;
            }
            tuning.stalled_flushes = 0;
        }
    }

    pub fn stats(&self) -> TreeStats {
        let nodes = self.nodes.read();
        let total_nodes = nodes.len();
        let leaf_nodes = nodes
            .values()
            .filter(|n| n.read().is_leaf())
            .count();
        let bytes_buffered = self.buffer.total_bytes();
        let capacity = total_nodes * self.config.node_size_bytes;
        TreeStats {
            total_nodes,
            leaf_nodes,
            messages_buffered: self.buffer.message_count(),
            bytes_buffered,
            avg_fill_ratio: if capacity > 0 {
                bytes_buffered as f32 / capacity as f32
            } else {
                0.0
            },
            flush_count: self.flush_count.load(Ordering::Relaxed),
            failed_flush_count: self.failed_flush_count.load(Ordering::Relaxed),
            epsilon: self.tuning.lock().epsilon,
        }
    }

    fn node(&self, id: NodeId) -> Result<Arc<RwLock<Node>>> {
        self.nodes
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SiltError::invariant(format!("unknown node {id}")))
    }
}

/// Evenly partition the u64 hash space into `n` contiguous ranges
fn even_partition(i: usize, n: usize) -> HashRange {
    let span = 1u128 << 64;
    let lo = (i as u128 * span / n as u128) as u64;
    let hi = if i + 1 == n {
        u64::MAX
    } else {
        ((i as u128 + 1) * span / n as u128 - 1) as u64
    };
    HashRange::new(lo, hi)
}

//! Segment encoder abstraction
//!
//! The engine never writes segment files itself; it hands a flush batch to a
//! [`SegmentEncoder`] and trusts the returned descriptor. The encoder owns
//! the on-disk format, checksumming, and durability: `encode_segment` must
//! not return until the segment file and its directory are fsynced.

pub mod mock;

use crate::error::Result;
use crate::types::{Message, SegmentDescriptor, SegmentRow};
use async_trait::async_trait;

/// Downstream contract for persisting flush batches
///
/// The returned descriptor's (min_epoch, max_epoch) must bound the epochs of
/// the encoded messages. A failure leaves the messages in the buffer; the
/// flush is retried, so encoders must tolerate re-encoding the same batch
/// (duplicates are resolved by manifest generation numbers).
#[async_trait]
pub trait SegmentEncoder: Send + Sync + 'static {
    /// Write a new immutable segment from the batch, durable before returning
    async fn encode_segment(&self, messages: &[Message]) -> Result<SegmentDescriptor>;

    /// Read back a segment's row table, used to rebuild the latest-by-id map
    /// during recovery
    async fn read_row_table(&self, descriptor: &SegmentDescriptor) -> Result<Vec<SegmentRow>>;
}

/// Build the row table for a batch in flush order
///
/// Row `i` of the segment corresponds to message `i` of the batch; encoders
/// are expected to preserve that ordering.
pub fn row_table_for_batch(messages: &[Message]) -> Vec<SegmentRow> {
    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| SegmentRow {
            id: msg.entry.id.clone(),
            id_hash: msg.entry.id_hash,
            epoch: msg.epoch,
            tombstone: msg.op == crate::types::OpKind::Delete,
            local_row: i as u32,
        })
        .collect()
}

//! Identity hashing
//!
//! The canonical routing hash: xxHash64 with seed 0. The hash alone is not
//! collision-safe; callers pair it with the full identifier bytes for
//! equality confirmation.

use crate::types::IdHash;
use xxhash_rust::xxh64::xxh64;

/// Hash a client-supplied identifier for shard routing and indexing
#[inline]
pub fn identity_hash(id: &[u8]) -> IdHash {
    xxh64(id, 0)
}

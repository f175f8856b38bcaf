//! Tree node structures
//!
//! Internal nodes hold pivots over the identity-hash space; leaves hold the
//! hash range they cover and the descriptors of the segments bound to it.
//! Children of an internal node tile its range contiguously: child `i`
//! covers `(pivot[i-1], pivot[i]]` with the outermost bounds taken from the
//! node's own range.

use crate::types::{HashRange, IdHash, SegmentDescriptor};

pub(crate) type NodeId = u64;

#[derive(Debug)]
pub(crate) enum NodeKind {
    Internal {
        /// Sorted child upper bounds, exclusive of the last child's
        pivots: Vec<IdHash>,
        children: Vec<NodeId>,
    },
    Leaf {
        segments: Vec<SegmentDescriptor>,
    },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub parent: Option<NodeId>,
    pub range: HashRange,
    pub kind: NodeKind,
}

impl Node {
    pub fn internal(
        parent: Option<NodeId>,
        range: HashRange,
        pivots: Vec<IdHash>,
        children: Vec<NodeId>,
    ) -> Self {
        debug_assert_eq!(children.len(), pivots.len() + 1);
        Self {
            parent,
            range,
            kind: NodeKind::Internal { pivots, children },
        }
    }

    pub fn leaf(parent: Option<NodeId>, range: HashRange) -> Self {
        Self {
            parent,
            range,
            kind: NodeKind::Leaf {
                segments: Vec::new(),
            },
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    /// Hash ranges covered by each child, in child order
    pub fn child_ranges(&self) -> Vec<HashRange> {
        let NodeKind::Internal { pivots, .. } = &self.kind else {
            return Vec::new();
        };
        let mut ranges = Vec::with_capacity(pivots.len() + 1);
        let mut lo = self.range.lo;
        for &pivot in pivots {
            ranges.push(HashRange::new(lo, pivot));
            lo = pivot + 1;
        }
        ranges.push(HashRange::new(lo, self.range.hi));
        ranges
    }

}

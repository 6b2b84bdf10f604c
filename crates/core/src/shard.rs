//! Shard range assignment for cooperating worker processes
//!
//! Every phase of a run (encode, fit, search) operates on a contiguous
//! slice of a logical dataset. `ShardRange::partition` computes the slice
//! for each rank so that the ranges of ranks `0..world` partition `[0, N)`
//! exactly: no gaps, no overlaps, union covers all rows.

use serde::{Deserialize, Serialize};

/// Half-open row interval `[start, end)` into a logical dataset
///
/// Assigned once per worker per phase. Disjointness across workers is what
/// makes concurrent range writes into one artifact safe without per-element
/// locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    /// First row owned by this shard
    pub start: usize,
    /// One past the last row owned by this shard
    pub end: usize,
}

impl ShardRange {
    /// Create a range; `start <= end` is the caller's responsibility
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "shard range start {} > end {}", start, end);
        ShardRange { start, end }
    }

    /// The whole dataset as a single shard
    pub fn full(total: usize) -> Self {
        ShardRange {
            start: 0,
            end: total,
        }
    }

    /// Number of rows in the range
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True when the range holds no rows
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Compute the range owned by `rank` out of `world` workers over
    /// `total` rows.
    ///
    /// Rows divide as evenly as possible; when `world` does not divide
    /// `total`, the remainder is spread over the lowest ranks, one extra
    /// row each.
    pub fn for_rank(total: usize, world: usize, rank: usize) -> Self {
        assert!(world > 0, "world size must be positive");
        assert!(rank < world, "rank {} out of range for world {}", rank, world);
        let base = total / world;
        let rem = total % world;
        let start = rank * base + rank.min(rem);
        let extra = if rank < rem { 1 } else { 0 };
        ShardRange {
            start,
            end: start + base + extra,
        }
    }

    /// Ranges for every rank, in rank order
    pub fn partition(total: usize, world: usize) -> Vec<Self> {
        (0..world)
            .map(|rank| Self::for_rank(total, world, rank))
            .collect()
    }
}

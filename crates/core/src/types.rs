//! Core identifier and array-layout types shared across all quarry crates.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;

/// Index of a document within the corpus
pub type DocId = u32;

/// Index of a query within the evaluation set
pub type QueryId = u32;

/// Vocabulary token id
///
/// Stored on disk as `i32` (padding rows use negative sentinels); in-memory
/// indexes only ever hold non-negative ids.
pub type TokenId = u32;

/// Padding sentinel used in code artifacts (`codes.mmp`)
pub const CODE_PAD: i32 = -1;

/// Element type of an on-disk array artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    /// 32-bit little-endian float
    F32,
    /// 32-bit little-endian signed integer
    I32,
}

impl Dtype {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
        }
    }

    /// Short name used in log messages
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::F32 => "f32",
            Dtype::I32 => "i32",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape + dtype of an array artifact
///
/// Identity of an artifact is its path plus this spec. The first axis is
/// always the row axis that shard ranges address; trailing axes are flattened
/// into the per-row element count. Specs live in configuration and are never
/// written to disk themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySpec {
    /// Dimensions, row axis first. `(N, L)` or `(N, L, D)` or `(N, D)`.
    pub shape: SmallVec<[usize; 3]>,
    /// Element type
    pub dtype: Dtype,
}

impl ArraySpec {
    /// Construct from a shape slice
    pub fn new(shape: &[usize], dtype: Dtype) -> Self {
        ArraySpec {
            shape: SmallVec::from_slice(shape),
            dtype,
        }
    }

    /// Number of rows (size of the shard-addressable axis)
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per row (product of trailing axes)
    pub fn row_elems(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Bytes per row
    pub fn row_bytes(&self) -> usize {
        self.row_elems() * self.dtype.size_bytes()
    }

    /// Total element count
    pub fn num_elems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Total byte size of the backing file
    pub fn num_bytes(&self) -> u64 {
        (self.num_elems() * self.dtype.size_bytes()) as u64
    }
}

/// A `(document, score)` pair produced by search
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredDoc {
    /// Document id
    pub doc: DocId,
    /// Similarity score; higher is better
    pub score: f32,
}

impl ScoredDoc {
    /// Create a new scored document
    pub fn new(doc: DocId, score: f32) -> Self {
        ScoredDoc { doc, score }
    }

    /// Ranking order: descending score, ties broken by ascending doc id
    ///
    /// This is the single ordering every ranked surface in the system uses,
    /// so equal-score results are deterministic across ranks and runs.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.doc.cmp(&other.doc))
    }
}

/// Per-query ranked candidates: query id to `(doc, score)` pairs
///
/// When a cutoff is in effect the per-query list is sorted by
/// [`ScoredDoc::rank_cmp`] and bounded by `hits`; with `hits == 0` the list
/// is unordered and unbounded.
pub type ResultMap = FxHashMap<QueryId, Vec<ScoredDoc>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(Dtype::F32.size_bytes(), 4);
        assert_eq!(Dtype::I32.size_bytes(), 4);
        assert_eq!(Dtype::F32.name(), "f32");
    }

    #[test]
    fn test_array_spec_2d() {
        let spec = ArraySpec::new(&[10, 16], Dtype::I32);
        assert_eq!(spec.rows(), 10);
        assert_eq!(spec.row_elems(), 16);
        assert_eq!(spec.row_bytes(), 64);
        assert_eq!(spec.num_bytes(), 640);
    }

    #[test]
    fn test_array_spec_3d() {
        let spec = ArraySpec::new(&[10, 16, 4], Dtype::F32);
        assert_eq!(spec.rows(), 10);
        assert_eq!(spec.row_elems(), 64);
        assert_eq!(spec.num_bytes(), 10 * 16 * 4 * 4);
    }

    #[test]
    fn test_rank_cmp_descending_score() {
        let a = ScoredDoc::new(3, 0.9);
        let b = ScoredDoc::new(1, 0.5);
        assert_eq!(a.rank_cmp(&b), Ordering::Less); // a sorts first
    }

    #[test]
    fn test_rank_cmp_tie_breaks_by_doc_id() {
        let a = ScoredDoc::new(7, 1.0);
        let b = ScoredDoc::new(2, 1.0);
        assert_eq!(b.rank_cmp(&a), Ordering::Less); // lower doc id first
        let mut v = vec![a, b];
        v.sort_by(ScoredDoc::rank_cmp);
        assert_eq!(v[0].doc, 2);
        assert_eq!(v[1].doc, 7);
    }
}

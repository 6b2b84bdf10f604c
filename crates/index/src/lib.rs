//! Index backends for quarry
//!
//! One contract, three structurally different implementations:
//! - `InvertedIndex`: posting lists over sparse token weights
//! - `VectorIndex`: exact flat scan or inverted-file ANN over embeddings
//! - `TrieIndex`: prefix tree over discrete codes, walked by constrained
//!   decoding rather than searched directly
//!
//! plus the `Verifier`, a second-pass exact re-scorer for candidate sets.
//! The backend is selected once from configuration; `IndexBackend` is the
//! tagged dispatch the pipeline holds.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod inverted;
mod persist;
pub mod trie;
pub mod vector;
pub mod verifier;

use quarry_core::{Error, Result, ResultMap};
use serde::{Deserialize, Serialize};

pub use inverted::{InvertedIndex, InvertedIndexOptions, Posting};
pub use trie::{NodeId, TrieIndex, TrieIndexOptions, ROOT};
pub use vector::{VectorIndex, VectorIndexOptions, VectorKind, VectorMetric};
pub use verifier::{PqState, Verifier};

// ============================================================================
// Search surface
// ============================================================================

/// Per-search cost diagnostic
///
/// `mean_visited` is the average number of candidates a query touched:
/// posting entries for the inverted index, scanned rows or probed bucket
/// members for the vector index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Queries answered
    pub queries: usize,
    /// Mean candidates visited per query
    pub mean_visited: f64,
}

/// One batch of encoded queries, in the representation the backend expects
#[derive(Debug, Clone, Copy)]
pub enum QueryBatch<'a> {
    /// Sparse token ids and weights, row-major `(count, token_len)`
    Sparse {
        /// Token ids; negative values are padding
        token_ids: &'a [i32],
        /// One weight per token slot
        weights: &'a [f32],
        /// Row width
        token_len: usize,
    },
    /// Dense embeddings, row-major `(count, dim)`
    Dense {
        /// Embedding values
        embeddings: &'a [f32],
    },
}

/// Backend selection tag, read once from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Inverted posting lists over sparse weights
    Inverted,
    /// Exact flat vector scan
    Flat,
    /// Inverted-file approximate vector index
    Ivf,
    /// Prefix tree for constrained generative retrieval
    Trie,
}

/// The fitted backend behind the pipeline's single search surface
#[derive(Debug)]
pub enum IndexBackend {
    /// Sparse posting lists
    Inverted(InvertedIndex),
    /// Dense vectors (flat or ivf)
    Vector(VectorIndex),
    /// Code trie; searched via constrained decoding, not here
    Trie(TrieIndex),
}

impl IndexBackend {
    /// Answer a query batch with top-`hits` candidates per query.
    ///
    /// `hits == 0` returns everything, unordered. An empty per-query
    /// result is valid, not an error. The trie backend rejects this
    /// surface: its retrieval is driven by constrained decoding.
    pub fn search(
        &self,
        queries: QueryBatch<'_>,
        query_offset: usize,
        hits: usize,
        verifier: Option<&Verifier>,
    ) -> Result<(ResultMap, SearchStats)> {
        match (self, queries) {
            (
                IndexBackend::Inverted(index),
                QueryBatch::Sparse {
                    token_ids,
                    weights,
                    token_len,
                },
            ) => Ok(index.search(token_ids, weights, token_len, query_offset, hits, verifier)),
            (IndexBackend::Vector(index), QueryBatch::Dense { embeddings }) => {
                index.search(embeddings, query_offset, hits, verifier)
            }
            (IndexBackend::Trie(_), _) => Err(Error::Unsupported(
                "trie index is retrieved via constrained decoding, not direct search".into(),
            )),
            (IndexBackend::Inverted(_), _) => Err(Error::InvalidOperation(
                "inverted index expects a sparse query batch".into(),
            )),
            (IndexBackend::Vector(_), _) => Err(Error::InvalidOperation(
                "vector index expects a dense query batch".into(),
            )),
        }
    }

    /// The trie, when this backend is the generative one
    pub fn as_trie(&self) -> Option<&TrieIndex> {
        match self {
            IndexBackend::Trie(trie) => Some(trie),
            _ => None,
        }
    }
}

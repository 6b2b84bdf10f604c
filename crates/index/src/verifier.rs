//! Second-pass exact re-scoring of candidate sets
//!
//! An index that approximates (pruned postings, quantized vectors) can
//! misrank the true top-k. The verifier recomputes a more faithful score
//! for the candidates the index produced. It never adds or removes a
//! candidate; it re-orders, re-scores, and may re-cut to a smaller `hits`.

use quarry_core::{DocId, Result, ScoredDoc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::persist;
use crate::vector::VectorMetric;

const PQ_MAGIC: &[u8; 4] = b"QPQS";

// ============================================================================
// Verifier
// ============================================================================

/// Candidate re-scorer selected by configuration
#[derive(Debug)]
pub struct Verifier {
    /// Cutoff applied after re-scoring; `0` keeps every candidate
    pub hits: usize,
    mode: VerifierMode,
}

#[derive(Debug)]
enum VerifierMode {
    Flat(FlatVerifier),
    Pq(PqVerifier),
}

impl Verifier {
    /// Exact verifier over full, unpruned embeddings.
    ///
    /// `query_embeddings` holds this worker's query shard, row-major;
    /// `text_embeddings` holds the corpus rows the worker's candidates can
    /// reference, starting at global document id `doc_offset`.
    pub fn flat(
        query_embeddings: Vec<f32>,
        text_embeddings: Vec<f32>,
        dim: usize,
        doc_offset: usize,
        metric: VectorMetric,
        hits: usize,
    ) -> Self {
        Verifier {
            hits,
            mode: VerifierMode::Flat(FlatVerifier {
                query_embeddings,
                text_embeddings,
                dim,
                doc_offset,
                metric,
            }),
        }
    }

    /// Product-quantized verifier: a tighter-but-approximate score from
    /// compressed codes, without materializing full embeddings.
    ///
    /// `codebooks` is `[m][ksub][dsub]` flattened; `codes` is `[n][m]`
    /// flattened, one subquantizer centroid id per document per segment.
    pub fn pq(
        query_embeddings: Vec<f32>,
        dim: usize,
        m: usize,
        ksub: usize,
        codebooks: Vec<f32>,
        codes: Vec<u8>,
        hits: usize,
    ) -> Self {
        debug_assert_eq!(dim % m, 0, "embedding dim must divide into m segments");
        Verifier {
            hits,
            mode: VerifierMode::Pq(PqVerifier {
                query_embeddings,
                dim,
                m,
                ksub,
                codebooks,
                codes,
            }),
        }
    }

    /// Re-score `candidates` for the worker-local query `query_idx`.
    ///
    /// Output order matches input order; one score per candidate.
    pub fn score(&self, query_idx: usize, candidates: &[DocId]) -> Vec<f32> {
        match &self.mode {
            VerifierMode::Flat(flat) => flat.score(query_idx, candidates),
            VerifierMode::Pq(pq) => pq.score(query_idx, candidates),
        }
    }

    /// Replace the scores of a ranked list, re-sort, and cut to
    /// [`Verifier::hits`].
    ///
    /// The document id set of the output is always a subset of the input's
    /// (equal, when `hits` is 0 or not smaller than the input).
    pub fn rescore(&self, query_idx: usize, ranked: Vec<ScoredDoc>) -> Vec<ScoredDoc> {
        let ids: Vec<DocId> = ranked.iter().map(|s| s.doc).collect();
        let scores = self.score(query_idx, &ids);
        let mut rescored: Vec<ScoredDoc> = ids
            .into_iter()
            .zip(scores)
            .map(|(doc, score)| ScoredDoc::new(doc, score))
            .collect();
        rescored.sort_by(ScoredDoc::rank_cmp);
        if self.hits > 0 {
            rescored.truncate(self.hits);
        }
        debug!(query_idx, kept = rescored.len(), "verifier re-scored candidates");
        rescored
    }
}

// ============================================================================
// Persisted PQ state
// ============================================================================

/// Product-quantizer artifact: codebooks plus per-document codes
///
/// Produced by an offline quantization pass over the corpus embeddings and
/// reloaded by workers that verify with the `pq` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqState {
    /// Embedding width the quantizer was trained on
    pub dim: usize,
    /// Subquantizer segments
    pub m: usize,
    /// Centroids per segment
    pub ksub: usize,
    /// `[m][ksub][dim/m]` flattened centroid table
    pub codebooks: Vec<f32>,
    /// `[n][m]` flattened per-document centroid ids
    pub codes: Vec<u8>,
}

impl PqState {
    /// Persist the quantizer state
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::save_state(path, PQ_MAGIC, self)
    }

    /// Reload state persisted by [`PqState::save`]
    pub fn load(path: &Path) -> Result<Self> {
        persist::load_state(path, PQ_MAGIC)
    }
}

// ============================================================================
// Flat
// ============================================================================

#[derive(Debug)]
struct FlatVerifier {
    query_embeddings: Vec<f32>,
    text_embeddings: Vec<f32>,
    dim: usize,
    doc_offset: usize,
    metric: VectorMetric,
}

impl FlatVerifier {
    fn score(&self, query_idx: usize, candidates: &[DocId]) -> Vec<f32> {
        let q = &self.query_embeddings[query_idx * self.dim..(query_idx + 1) * self.dim];
        candidates
            .iter()
            .map(|&doc| {
                let row = doc as usize - self.doc_offset;
                let d = &self.text_embeddings[row * self.dim..(row + 1) * self.dim];
                self.metric.score(q, d)
            })
            .collect()
    }
}

// ============================================================================
// Product-quantized
// ============================================================================

#[derive(Debug)]
struct PqVerifier {
    query_embeddings: Vec<f32>,
    dim: usize,
    m: usize,
    ksub: usize,
    codebooks: Vec<f32>,
    codes: Vec<u8>,
}

impl PqVerifier {
    /// Inner product against the PQ reconstruction, via a per-query lookup
    /// table: one dot product per (segment, centroid), then a table walk
    /// per candidate.
    fn score(&self, query_idx: usize, candidates: &[DocId]) -> Vec<f32> {
        let dsub = self.dim / self.m;
        let q = &self.query_embeddings[query_idx * self.dim..(query_idx + 1) * self.dim];

        let mut lut = vec![0f32; self.m * self.ksub];
        for seg in 0..self.m {
            let q_seg = &q[seg * dsub..(seg + 1) * dsub];
            for k in 0..self.ksub {
                let base = (seg * self.ksub + k) * dsub;
                let centroid = &self.codebooks[base..base + dsub];
                lut[seg * self.ksub + k] = q_seg
                    .iter()
                    .zip(centroid)
                    .map(|(a, b)| a * b)
                    .sum();
            }
        }

        candidates
            .iter()
            .map(|&doc| {
                let code = &self.codes[doc as usize * self.m..(doc as usize + 1) * self.m];
                code.iter()
                    .enumerate()
                    .map(|(seg, &k)| lut[seg * self.ksub + k as usize])
                    .sum()
            })
            .collect()
    }
}

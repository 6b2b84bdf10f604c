//! Dense vector index: exact flat scan or inverted-file approximation
//!
//! The flat variant scans every row and is exact; it must be fitted over
//! the full, non-sharded embedding set. The inverted-file variant trains
//! centroids with seeded k-means, buckets rows by nearest centroid, and at
//! search time visits only the `nprobe` nearest buckets; it tolerates
//! sharded construction via `doc_offset`.

use quarry_core::{DocId, Error, Result, ResultMap, ScoredDoc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::persist;
use crate::verifier::Verifier;
use crate::SearchStats;

const MAGIC: &[u8; 4] = b"QVEC";

/// Similarity metric; scores are always "higher is better"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorMetric {
    /// Inner product
    #[serde(rename = "ip")]
    InnerProduct,
    /// Negative squared euclidean distance
    L2,
}

impl VectorMetric {
    /// Score `q` against `d`
    pub fn score(&self, q: &[f32], d: &[f32]) -> f32 {
        match self {
            VectorMetric::InnerProduct => q.iter().zip(d).map(|(a, b)| a * b).sum(),
            VectorMetric::L2 => {
                let dist: f32 = q.iter().zip(d).map(|(a, b)| (a - b) * (a - b)).sum();
                -dist
            }
        }
    }
}

/// Structure variant selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorKind {
    /// Exact scan over every row
    Flat,
    /// Inverted file over k-means centroids
    Ivf,
}

/// Construction options for [`VectorIndex::fit`]
#[derive(Debug, Clone)]
pub struct VectorIndexOptions {
    /// Structure variant
    pub kind: VectorKind,
    /// Similarity metric
    pub metric: VectorMetric,
    /// Embedding width
    pub dim: usize,
    /// Total corpus size; the flat variant must be fitted over exactly
    /// this many rows
    pub corpus_size: usize,
    /// Global document id of row 0 (sharded construction, `ivf` only)
    pub doc_offset: usize,
    /// Centroid count (`ivf`)
    pub nlist: usize,
    /// K-means refinement iterations (`ivf`)
    pub train_iters: usize,
    /// Seed for deterministic centroid training
    pub seed: u64,
    /// Buckets visited per query (`ivf`); search-time tunable
    pub nprobe: usize,
}

impl Default for VectorIndexOptions {
    fn default() -> Self {
        VectorIndexOptions {
            kind: VectorKind::Flat,
            metric: VectorMetric::InnerProduct,
            dim: 0,
            corpus_size: 0,
            doc_offset: 0,
            nlist: 64,
            train_iters: 10,
            seed: 42,
            nprobe: 8,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum VectorStructure {
    Flat,
    Ivf {
        nlist: usize,
        centroids: Vec<f32>,
        lists: Vec<Vec<DocId>>,
    },
}

/// Fitted dense index
#[derive(Debug, Serialize, Deserialize)]
pub struct VectorIndex {
    metric: VectorMetric,
    dim: usize,
    doc_offset: usize,
    nprobe: usize,
    data: Vec<f32>,
    structure: VectorStructure,
}

impl VectorIndex {
    /// Train or bucket the structure over `embeddings` (row-major).
    pub fn fit(embeddings: &[f32], opts: &VectorIndexOptions) -> Result<Self> {
        if opts.dim == 0 || embeddings.len() % opts.dim != 0 {
            return Err(Error::InvalidOperation(format!(
                "embedding buffer of {} elements does not divide into rows of {}",
                embeddings.len(),
                opts.dim
            )));
        }
        let rows = embeddings.len() / opts.dim;

        let structure = match opts.kind {
            VectorKind::Flat => {
                // exact search needs the whole corpus in one piece
                if opts.doc_offset != 0 || rows != opts.corpus_size {
                    return Err(Error::CorpusSizeMismatch {
                        expected: opts.corpus_size,
                        actual: rows,
                    });
                }
                info!(rows, dim = opts.dim, "fitted flat vector index");
                VectorStructure::Flat
            }
            VectorKind::Ivf => {
                let nlist = opts.nlist.min(rows).max(1);
                let centroids = kmeans(
                    embeddings,
                    opts.dim,
                    nlist,
                    opts.train_iters,
                    opts.seed,
                    opts.metric,
                );
                let mut lists: Vec<Vec<DocId>> = vec![Vec::new(); nlist];
                for row in 0..rows {
                    let v = &embeddings[row * opts.dim..(row + 1) * opts.dim];
                    let best = nearest_centroid(v, &centroids, opts.dim, opts.metric);
                    lists[best].push((opts.doc_offset + row) as DocId);
                }
                info!(rows, nlist, "fitted ivf vector index");
                VectorStructure::Ivf {
                    nlist,
                    centroids,
                    lists,
                }
            }
        };

        Ok(VectorIndex {
            metric: opts.metric,
            dim: opts.dim,
            doc_offset: opts.doc_offset,
            nprobe: opts.nprobe.max(1),
            data: embeddings.to_vec(),
            structure,
        })
    }

    /// Rows held by this index
    pub fn rows(&self) -> usize {
        self.data.len() / self.dim.max(1)
    }

    /// Nearest neighbors for each query row.
    ///
    /// The stats report the mean candidates visited per query: all rows
    /// for flat, the probed buckets' members for ivf.
    pub fn search(
        &self,
        queries: &[f32],
        query_offset: usize,
        hits: usize,
        verifier: Option<&Verifier>,
    ) -> Result<(ResultMap, SearchStats)> {
        if self.dim == 0 || queries.len() % self.dim != 0 {
            return Err(Error::InvalidOperation(format!(
                "query buffer of {} elements does not divide into rows of {}",
                queries.len(),
                self.dim
            )));
        }
        let count = queries.len() / self.dim;
        let mut results = ResultMap::default();
        let mut visited = 0usize;

        for q in 0..count {
            let query = &queries[q * self.dim..(q + 1) * self.dim];
            let mut ranked: Vec<ScoredDoc> = match &self.structure {
                VectorStructure::Flat => {
                    visited += self.rows();
                    (0..self.rows())
                        .map(|row| {
                            let d = &self.data[row * self.dim..(row + 1) * self.dim];
                            ScoredDoc::new(row as DocId, self.metric.score(query, d))
                        })
                        .collect()
                }
                VectorStructure::Ivf {
                    nlist,
                    centroids,
                    lists,
                } => {
                    let mut by_centroid: Vec<ScoredDoc> = (0..*nlist)
                        .map(|c| {
                            let centroid = &centroids[c * self.dim..(c + 1) * self.dim];
                            ScoredDoc::new(c as DocId, self.metric.score(query, centroid))
                        })
                        .collect();
                    by_centroid.sort_by(ScoredDoc::rank_cmp);

                    let mut candidates = Vec::new();
                    for probe in by_centroid.iter().take(self.nprobe) {
                        for &doc in &lists[probe.doc as usize] {
                            let row = doc as usize - self.doc_offset;
                            let d = &self.data[row * self.dim..(row + 1) * self.dim];
                            candidates.push(ScoredDoc::new(doc, self.metric.score(query, d)));
                        }
                    }
                    visited += candidates.len();
                    candidates
                }
            };

            if hits > 0 {
                ranked.sort_by(ScoredDoc::rank_cmp);
                ranked.truncate(hits);
            }
            if let Some(verifier) = verifier {
                ranked = verifier.rescore(q, ranked);
            }
            results.insert((query_offset + q) as u32, ranked);
        }

        let stats = SearchStats {
            queries: count,
            mean_visited: if count == 0 {
                0.0
            } else {
                visited as f64 / count as f64
            },
        };
        Ok((results, stats))
    }

    /// Persist the fitted structure
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::save_state(path, MAGIC, self)
    }

    /// Reload a structure persisted by [`VectorIndex::save`]
    pub fn load(path: &Path) -> Result<Self> {
        persist::load_state(path, MAGIC)
    }
}

/// Index of the best-scoring centroid for `v`
fn nearest_centroid(v: &[f32], centroids: &[f32], dim: usize, metric: VectorMetric) -> usize {
    let nlist = centroids.len() / dim;
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for c in 0..nlist {
        let score = metric.score(v, &centroids[c * dim..(c + 1) * dim]);
        if score > best_score {
            best = c;
            best_score = score;
        }
    }
    best
}

/// Seeded k-means over row-major `data`; deterministic for a given seed.
///
/// Initial centroids are sampled rows; each refinement pass reassigns rows
/// to their best centroid under `metric` and recomputes means. A cluster
/// left empty is reseeded from a random row.
fn kmeans(
    data: &[f32],
    dim: usize,
    nlist: usize,
    iters: usize,
    seed: u64,
    metric: VectorMetric,
) -> Vec<f32> {
    let rows = data.len() / dim;
    if rows == 0 {
        return vec![0f32; nlist * dim];
    }
    let mut rng = StdRng::seed_from_u64(seed);

    let mut centroids = vec![0f32; nlist * dim];
    for c in 0..nlist {
        let row = rng.gen_range(0..rows);
        centroids[c * dim..(c + 1) * dim].copy_from_slice(&data[row * dim..(row + 1) * dim]);
    }

    let mut assignment = vec![0usize; rows];
    for _ in 0..iters {
        for row in 0..rows {
            let v = &data[row * dim..(row + 1) * dim];
            assignment[row] = nearest_centroid(v, &centroids, dim, metric);
        }

        let mut sums = vec![0f32; nlist * dim];
        let mut counts = vec![0usize; nlist];
        for row in 0..rows {
            let c = assignment[row];
            counts[c] += 1;
            for d in 0..dim {
                sums[c * dim + d] += data[row * dim + d];
            }
        }
        for c in 0..nlist {
            if counts[c] == 0 {
                let row = rng.gen_range(0..rows);
                centroids[c * dim..(c + 1) * dim]
                    .copy_from_slice(&data[row * dim..(row + 1) * dim]);
            } else {
                for d in 0..dim {
                    centroids[c * dim + d] = sums[c * dim + d] / counts[c] as f32;
                }
            }
        }
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn flat_opts(dim: usize, corpus: usize) -> VectorIndexOptions {
        VectorIndexOptions {
            kind: VectorKind::Flat,
            dim,
            corpus_size: corpus,
            ..Default::default()
        }
    }

    #[test]
    fn test_flat_exact_neighbors() {
        let data = vec![
            1.0, 0.0, //
            0.0, 1.0, //
            0.9, 0.1,
        ];
        let index = VectorIndex::fit(&data, &flat_opts(2, 3)).unwrap();
        let (results, stats) = index.search(&[1.0, 0.0], 0, 2, None).unwrap();

        let ranked = &results[&0];
        assert_eq!(ranked[0].doc, 0);
        assert_eq!(ranked[1].doc, 2);
        assert!((stats.mean_visited - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_rejects_sharded_fit() {
        let mut opts = flat_opts(2, 10);
        let err = VectorIndex::fit(&[0.0; 8], &opts).unwrap_err();
        assert!(matches!(err, Error::CorpusSizeMismatch { expected: 10, actual: 4 }));

        opts.corpus_size = 4;
        opts.doc_offset = 4;
        let err = VectorIndex::fit(&[0.0; 8], &opts).unwrap_err();
        assert!(matches!(err, Error::CorpusSizeMismatch { .. }));
    }

    #[test]
    fn test_l2_metric_orders_by_distance() {
        let data = vec![
            0.0, 0.0, //
            3.0, 4.0,
        ];
        let mut opts = flat_opts(2, 2);
        opts.metric = VectorMetric::L2;
        let index = VectorIndex::fit(&data, &opts).unwrap();
        let (results, _) = index.search(&[0.1, 0.1], 0, 2, None).unwrap();

        let ranked = &results[&0];
        assert_eq!(ranked[0].doc, 0);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_ivf_search_probes_a_subset() {
        // two well-separated clusters around (0,10) and (10,0)
        let mut data = Vec::new();
        for i in 0..8 {
            data.extend_from_slice(&[i as f32 * 0.01, 10.0]);
        }
        for i in 0..8 {
            data.extend_from_slice(&[10.0, i as f32 * 0.01]);
        }
        let opts = VectorIndexOptions {
            kind: VectorKind::Ivf,
            metric: VectorMetric::L2,
            dim: 2,
            corpus_size: 16,
            nlist: 2,
            nprobe: 1,
            ..Default::default()
        };
        let index = VectorIndex::fit(&data, &opts).unwrap();
        // the query equals row 0 exactly, so row 0 shares its best bucket
        let (results, stats) = index.search(&[0.0, 10.0], 0, 4, None).unwrap();

        // the probed bucket holds the query's own row, so it ranks first
        assert!(stats.mean_visited > 0.0);
        assert_eq!(results[&0][0].doc, 0);
        assert!((results[&0][0].score - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_ivf_full_probe_is_exact() {
        let data = vec![
            1.0, 0.0, //
            0.0, 1.0, //
            0.9, 0.1, //
            0.1, 0.9,
        ];
        let opts = VectorIndexOptions {
            kind: VectorKind::Ivf,
            dim: 2,
            corpus_size: 4,
            nlist: 2,
            nprobe: 2,
            ..Default::default()
        };
        let index = VectorIndex::fit(&data, &opts).unwrap();
        let (results, stats) = index.search(&[1.0, 0.0], 0, 2, None).unwrap();

        // both buckets probed: every row visited, exact ranking
        assert!((stats.mean_visited - 4.0).abs() < 1e-9);
        let docs: Vec<DocId> = results[&0].iter().map(|s| s.doc).collect();
        assert_eq!(docs, vec![0, 2]);
    }

    #[test]
    fn test_ivf_fit_is_deterministic() {
        let data: Vec<f32> = (0..64).map(|i| (i % 9) as f32).collect();
        let opts = VectorIndexOptions {
            kind: VectorKind::Ivf,
            dim: 4,
            corpus_size: 16,
            nlist: 3,
            seed: 7,
            ..Default::default()
        };
        let a = VectorIndex::fit(&data, &opts).unwrap();
        let b = VectorIndex::fit(&data, &opts).unwrap();
        let (ra, _) = a.search(&data[0..4], 0, 5, None).unwrap();
        let (rb, _) = b.search(&data[0..4], 0, 5, None).unwrap();
        assert_eq!(ra[&0], rb[&0]);
    }

    #[test]
    fn test_ivf_doc_offset() {
        let data = vec![1.0, 0.0, 0.0, 1.0];
        let opts = VectorIndexOptions {
            kind: VectorKind::Ivf,
            dim: 2,
            corpus_size: 100,
            doc_offset: 50,
            nlist: 1,
            nprobe: 1,
            ..Default::default()
        };
        let index = VectorIndex::fit(&data, &opts).unwrap();
        let (results, _) = index.search(&[1.0, 0.0], 0, 2, None).unwrap();
        let docs: Vec<DocId> = results[&0].iter().map(|s| s.doc).collect();
        assert_eq!(docs, vec![50, 51]);
    }

    #[test]
    fn test_query_offset_shifts_query_ids() {
        let data = vec![1.0, 0.0];
        let index = VectorIndex::fit(&data, &flat_opts(2, 1)).unwrap();
        let (results, _) = index.search(&[1.0, 0.0], 20, 1, None).unwrap();
        assert!(results.contains_key(&20));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector.idx");
        let data = vec![1.0, 0.0, 0.0, 1.0];
        let index = VectorIndex::fit(&data, &flat_opts(2, 2)).unwrap();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path).unwrap();
        let (results, _) = loaded.search(&[1.0, 0.0], 0, 1, None).unwrap();
        assert_eq!(results[&0][0].doc, 0);
    }
}

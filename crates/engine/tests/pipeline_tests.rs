//! Single-process pipeline runs across the three backends

use std::path::PathBuf;

use quarry_beam::NextTokenScorer;
use quarry_comm::SingleProcess;
use quarry_core::{ArraySpec, Dtype, QueryId, ShardRange, TokenId};
use quarry_engine::{
    load_result_ids, load_result_scores, Dataset, EncodedRecord, Encoder, EngineConfig,
    RetrievalPipeline, VerifierKind,
};
use quarry_index::{IndexKind, VectorMetric};
use quarry_store::{ArtifactStore, CacheLayout};
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

struct RowDataset {
    rows: Vec<Vec<i32>>,
}

impl Dataset for RowDataset {
    type Record = Vec<i32>;

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn get(&self, idx: usize) -> Vec<i32> {
        self.rows[idx].clone()
    }
}

/// Sparse encoder: identity token ids, uniform weight 1 on non-padding
struct UniformSparseEncoder {
    token_len: usize,
}

impl Encoder<Vec<i32>> for UniformSparseEncoder {
    fn token_len(&self) -> usize {
        self.token_len
    }

    fn weight_dim(&self) -> usize {
        1
    }

    fn encode_step(&self, record: &Vec<i32>) -> EncodedRecord {
        EncodedRecord {
            token_ids: record.clone(),
            weights: record
                .iter()
                .map(|&t| if t < 0 { 0.0 } else { 1.0 })
                .collect(),
        }
    }
}

/// Dense encoder: the record already is the embedding, scaled by 0.1
struct DenseEncoder {
    dim: usize,
}

impl Encoder<Vec<i32>> for DenseEncoder {
    fn token_len(&self) -> usize {
        1
    }

    fn weight_dim(&self) -> usize {
        self.dim
    }

    fn encode_step(&self, record: &Vec<i32>) -> EncodedRecord {
        EncodedRecord {
            token_ids: vec![0],
            weights: record.iter().map(|&v| v as f32 * 0.1).collect(),
        }
    }
}

fn base_config(root: PathBuf, kind: IndexKind) -> EngineConfig {
    let json = format!(
        r#"{{
            "cache_root": {root:?},
            "model": "toy",
            "hits": 2,
            "index": {{ "kind": "{kind}", "vocab_size": 16, "nlist": 2, "nprobe": 2 }}
        }}"#,
        root = root,
        kind = match kind {
            IndexKind::Inverted => "inverted",
            IndexKind::Flat => "flat",
            IndexKind::Ivf => "ivf",
            IndexKind::Trie => "trie",
        },
    );
    serde_json::from_str(&json).unwrap()
}

// ============================================================================
// Sparse
// ============================================================================

#[test]
fn test_inverted_pipeline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path().to_path_buf(), IndexKind::Inverted);
    let coord = SingleProcess;
    let pipeline = RetrievalPipeline::new(&config, &coord).unwrap();

    let text = RowDataset {
        rows: vec![vec![1, 2], vec![1, 3], vec![2, 2], vec![3, 3]],
    };
    let queries = RowDataset {
        rows: vec![vec![1, -1]],
    };
    let encoder = UniformSparseEncoder { token_len: 2 };

    let result = pipeline
        .retrieve(&text, &encoder, &queries, &encoder)
        .unwrap()
        .expect("main rank returns the merged result");

    // docs 0 and 1 both score 1.0; tie-break by ascending id
    let ranked = &result[&0];
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].doc, 0);
    assert_eq!(ranked[1].doc, 1);
    assert!((ranked[0].score - 1.0).abs() < 1e-6);

    // id-only result file is on disk
    let layout = CacheLayout::new(dir.path(), "toy");
    let ids = load_result_ids(&layout.result_path("dev", "retrieval")).unwrap();
    assert_eq!(ids[&0], vec![0, 1]);

    // cost diagnostic was gathered
    assert!(pipeline.metrics().get("mean_visited").unwrap() > 0.0);
}

#[test]
fn test_inverted_pipeline_saves_scores_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf(), IndexKind::Inverted);
    config.save_scores = true;
    let coord = SingleProcess;
    let pipeline = RetrievalPipeline::new(&config, &coord).unwrap();

    let text = RowDataset {
        rows: vec![vec![1, 2], vec![1, 3]],
    };
    let queries = RowDataset {
        rows: vec![vec![1, -1]],
    };
    let encoder = UniformSparseEncoder { token_len: 2 };
    pipeline.retrieve(&text, &encoder, &queries, &encoder).unwrap();

    let layout = CacheLayout::new(dir.path(), "toy");
    let scored = load_result_scores(&layout.result_with_scores_path("dev", "retrieval")).unwrap();
    assert!((scored[&0][0].score - 1.0).abs() < 1e-6);
}

// ============================================================================
// Dense
// ============================================================================

#[test]
fn test_flat_pipeline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf(), IndexKind::Flat);
    config.index.metric = VectorMetric::InnerProduct;
    let coord = SingleProcess;
    let pipeline = RetrievalPipeline::new(&config, &coord).unwrap();

    let text = RowDataset {
        rows: vec![vec![10, 0], vec![0, 10], vec![9, 1]],
    };
    let queries = RowDataset {
        rows: vec![vec![10, 0]],
    };
    let encoder = DenseEncoder { dim: 2 };

    let result = pipeline
        .retrieve(&text, &encoder, &queries, &encoder)
        .unwrap()
        .unwrap();

    let docs: Vec<u32> = result[&0].iter().map(|s| s.doc).collect();
    assert_eq!(docs, vec![0, 2]);
}

#[test]
fn test_ivf_pipeline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf(), IndexKind::Ivf);
    config.index.metric = VectorMetric::L2;
    let coord = SingleProcess;
    let pipeline = RetrievalPipeline::new(&config, &coord).unwrap();

    let text = RowDataset {
        rows: vec![vec![0, 100], vec![1, 100], vec![100, 0], vec![100, 1]],
    };
    let queries = RowDataset {
        rows: vec![vec![0, 100]],
    };
    let encoder = DenseEncoder { dim: 2 };

    let result = pipeline
        .retrieve(&text, &encoder, &queries, &encoder)
        .unwrap()
        .unwrap();

    let docs: Vec<u32> = result[&0].iter().map(|s| s.doc).collect();
    assert_eq!(docs, vec![0, 1]);
}

// ============================================================================
// Verifier
// ============================================================================

/// Lay down dense-src embeddings the verifier will read
fn write_verifier_embeddings(root: &std::path::Path, query: &[f32], text: &[f32], dim: usize) {
    let store = ArtifactStore::new();
    let layout = CacheLayout::new(root, "dense-src");

    let query_spec = ArraySpec::new(&[query.len() / dim, dim], Dtype::F32);
    let query_path = layout.query_embeddings("dev");
    store.create(&query_path, &query_spec).unwrap();
    store
        .write_range_f32(&query_path, &query_spec, ShardRange::full(query.len() / dim), query)
        .unwrap();

    let text_spec = ArraySpec::new(&[text.len() / dim, dim], Dtype::F32);
    let text_path = layout.text_embeddings("default");
    store.create(&text_path, &text_spec).unwrap();
    store
        .write_range_f32(&text_path, &text_spec, ShardRange::full(text.len() / dim), text)
        .unwrap();
}

#[test]
fn test_flat_verifier_rescores_candidates() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf(), IndexKind::Inverted);
    config.verifier.kind = VerifierKind::Flat;
    config.verifier.src = "dense-src".to_string();
    config.verifier.dim = 2;
    config.verifier.hits = 1;

    // exact embeddings rank doc1 above doc0, reversing the tie
    write_verifier_embeddings(
        dir.path(),
        &[1.0, 0.0],
        &[0.2, 0.0, 0.8, 0.0],
        2,
    );

    let coord = SingleProcess;
    let pipeline = RetrievalPipeline::new(&config, &coord).unwrap();
    let text = RowDataset {
        rows: vec![vec![1, 2], vec![1, 3]],
    };
    let queries = RowDataset {
        rows: vec![vec![1, -1]],
    };
    let encoder = UniformSparseEncoder { token_len: 2 };

    let result = pipeline
        .retrieve(&text, &encoder, &queries, &encoder)
        .unwrap()
        .unwrap();

    // cut to verifier hits, doc1 wins on the exact score
    let ranked = &result[&0];
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].doc, 1);
    assert!((ranked[0].score - 0.8).abs() < 1e-6);
}

#[test]
fn test_missing_verifier_artifact_degrades_to_none() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf(), IndexKind::Inverted);
    config.verifier.kind = VerifierKind::Flat;
    config.verifier.src = "absent-model".to_string();
    config.verifier.dim = 2;
    config.verifier.hits = 2;

    let coord = SingleProcess;
    let pipeline = RetrievalPipeline::new(&config, &coord).unwrap();
    let text = RowDataset {
        rows: vec![vec![1, 2], vec![1, 3]],
    };
    let queries = RowDataset {
        rows: vec![vec![1, -1]],
    };
    let encoder = UniformSparseEncoder { token_len: 2 };

    // run completes unverified, with the index's own scores
    let result = pipeline
        .retrieve(&text, &encoder, &queries, &encoder)
        .unwrap()
        .unwrap();
    assert_eq!(result[&0].len(), 2);
    assert!((result[&0][0].score - 1.0).abs() < 1e-6);
}

// ============================================================================
// Generative
// ============================================================================

/// Uniform scorer over a tiny code vocabulary
struct UniformScorer;

impl NextTokenScorer for UniformScorer {
    fn vocab_size(&self) -> usize {
        16
    }

    fn log_probs(&self, _query: QueryId, _prefix: &[TokenId]) -> Vec<f32> {
        vec![-1.0; 16]
    }
}

#[test]
fn test_generative_pipeline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf(), IndexKind::Trie);
    config.index.code_len = 4;
    config.beam.nbeam = 2;
    config.beam.max_new_tokens = 3;

    // codes artifact: doc0 [5,6], doc1 [5,7], with start marker and padding
    let store = ArtifactStore::new();
    let layout = CacheLayout::new(dir.path(), "toy");
    let codes_path = layout.codes_path(&config.index.code_kind, 4);
    let spec = ArraySpec::new(&[2, 4], Dtype::I32);
    store.create(&codes_path, &spec).unwrap();
    store
        .write_range_i32(
            &codes_path,
            &spec,
            ShardRange::full(2),
            &[0, 5, 6, -1, 0, 5, 7, -1],
        )
        .unwrap();

    let coord = SingleProcess;
    let pipeline = RetrievalPipeline::new(&config, &coord).unwrap();
    let result = pipeline
        .retrieve_generative(&UniformScorer, None, 2, 1)
        .unwrap()
        .unwrap();

    let docs: Vec<u32> = result[&0].iter().map(|s| s.doc).collect();
    assert_eq!(docs, vec![0, 1]);

    let ids = load_result_ids(&layout.result_path("dev", "retrieval")).unwrap();
    assert_eq!(ids[&0], vec![0, 1]);
}

//! Sharded encoding into cache artifacts
//!
//! Each worker encodes its shard of the dataset into in-memory buffers,
//! then range-writes them into the shared artifacts. The creator barrier
//! guarantees the files exist before any range write; the completion
//! barrier guarantees every shard is on disk before anything reads the
//! whole artifact.

use std::path::Path;

use quarry_comm::Coordinator;
use quarry_core::{ArraySpec, Dtype, Error, Result, ShardRange};
use quarry_store::ArtifactStore;
use tracing::info;

use crate::encoder::{Dataset, Encoder};

/// A worker's encoded shard plus the layout facts downstream phases need
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    /// Shard token ids, row-major `(shard_rows, token_len)`
    pub token_ids: Vec<i32>,
    /// Shard weights, row-major `(shard_rows, token_len * weight_dim)`
    pub weights: Vec<f32>,
    /// The rows this worker owns
    pub shard: ShardRange,
    /// Rows in the whole dataset
    pub total_rows: usize,
    /// Token slots per row
    pub token_len: usize,
    /// Weight values per token slot
    pub weight_dim: usize,
}

impl EncodeOutput {
    /// Artifact spec of the token-id array
    pub fn token_spec(&self) -> ArraySpec {
        ArraySpec::new(&[self.total_rows, self.token_len], Dtype::I32)
    }

    /// Artifact spec of the weight array
    pub fn weight_spec(&self) -> ArraySpec {
        ArraySpec::new(
            &[self.total_rows, self.token_len, self.weight_dim],
            Dtype::F32,
        )
    }
}

/// Encode this worker's shard, or load it from the cached artifacts.
///
/// With `load_encode` the artifacts must already exist and match the
/// expected shapes; encoding is skipped entirely. Otherwise every record
/// of the shard runs through the encoder, and with `save_encode` the
/// buffers are range-written into freshly created artifacts.
#[allow(clippy::too_many_arguments)]
pub fn encode_split<C, D, E>(
    store: &ArtifactStore,
    coord: &C,
    dataset: &D,
    encoder: &E,
    token_path: &Path,
    weight_path: &Path,
    load_encode: bool,
    save_encode: bool,
    what: &str,
) -> Result<EncodeOutput>
where
    C: Coordinator,
    D: Dataset,
    E: Encoder<D::Record>,
{
    let total_rows = dataset.len();
    let shard = ShardRange::for_rank(total_rows, coord.world_size(), coord.rank());
    let token_len = encoder.token_len();
    let weight_dim = encoder.weight_dim();

    let token_spec = ArraySpec::new(&[total_rows, token_len], Dtype::I32);
    let weight_spec = ArraySpec::new(&[total_rows, token_len, weight_dim], Dtype::F32);

    if load_encode {
        info!(what, rows = shard.len(), "loading cached encoding");
        // map the artifacts and copy out only this worker's rows; the
        // buffers must be owned (gating mutates weights in place)
        let token_map = store.map(token_path, &token_spec)?;
        let weight_map = store.map(weight_path, &weight_spec)?;
        return Ok(EncodeOutput {
            token_ids: token_map.rows_i32(shard).to_vec(),
            weights: weight_map.rows_f32(shard).to_vec(),
            shard,
            total_rows,
            token_len,
            weight_dim,
        });
    }

    info!(what, rows = shard.len(), "encoding shard");
    let mut token_ids = Vec::with_capacity(shard.len() * token_len);
    let mut weights = Vec::with_capacity(shard.len() * token_len * weight_dim);
    for idx in shard.start..shard.end {
        let record = dataset.get(idx);
        let encoded = encoder.encode_step(&record);
        if encoded.token_ids.len() != token_len
            || encoded.weights.len() != token_len * weight_dim
        {
            return Err(Error::InvalidOperation(format!(
                "encoder produced {} ids / {} weights for row {}, expected {} / {}",
                encoded.token_ids.len(),
                encoded.weights.len(),
                idx,
                token_len,
                token_len * weight_dim
            )));
        }
        token_ids.extend_from_slice(&encoded.token_ids);
        weights.extend_from_slice(&encoded.weights);
    }

    if save_encode {
        if coord.is_main() {
            store.create(token_path, &token_spec)?;
            store.create(weight_path, &weight_spec)?;
        }
        // the artifacts exist before anyone range-writes
        coord.barrier()?;
        if !shard.is_empty() {
            store.write_range_i32(token_path, &token_spec, shard, &token_ids)?;
            store.write_range_f32(weight_path, &weight_spec, shard, &weights)?;
        }
        // every shard is on disk before anyone reads the whole array
        coord.barrier()?;
    }

    Ok(EncodeOutput {
        token_ids,
        weights,
        shard,
        total_rows,
        token_len,
        weight_dim,
    })
}

/// Zero all but the `k` largest weights of each row.
///
/// Sparse gating before indexing: fewer live postings, smaller index,
/// lower search cost, at the cost of recall. Requires `weight_dim == 1`.
pub fn gate_weights(weights: &mut [f32], token_len: usize, k: usize) {
    if k == 0 || token_len == 0 || k >= token_len {
        return;
    }
    for row in weights.chunks_mut(token_len) {
        let mut order: Vec<usize> = (0..token_len).collect();
        order.sort_by(|&a, &b| {
            row[b]
                .partial_cmp(&row[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for &i in order.iter().skip(k) {
            row[i] = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodedRecord;
    use quarry_comm::SingleProcess;
    use tempfile::TempDir;

    struct ToyDataset {
        rows: Vec<Vec<i32>>,
    }

    impl Dataset for ToyDataset {
        type Record = Vec<i32>;

        fn len(&self) -> usize {
            self.rows.len()
        }

        fn get(&self, idx: usize) -> Vec<i32> {
            self.rows[idx].clone()
        }
    }

    struct UnitEncoder {
        token_len: usize,
    }

    impl Encoder<Vec<i32>> for UnitEncoder {
        fn token_len(&self) -> usize {
            self.token_len
        }

        fn weight_dim(&self) -> usize {
            1
        }

        fn encode_step(&self, record: &Vec<i32>) -> EncodedRecord {
            EncodedRecord {
                token_ids: record.clone(),
                weights: record.iter().map(|&t| if t < 0 { 0.0 } else { 1.0 }).collect(),
            }
        }
    }

    #[test]
    fn test_encode_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new();
        let coord = SingleProcess;
        let dataset = ToyDataset {
            rows: vec![vec![1, 2], vec![3, -1], vec![2, 2]],
        };
        let encoder = UnitEncoder { token_len: 2 };
        let token_path = dir.path().join("token_ids.mmp");
        let weight_path = dir.path().join("embeddings.mmp");

        let encoded = encode_split(
            &store, &coord, &dataset, &encoder, &token_path, &weight_path, false, true, "text",
        )
        .unwrap();
        assert_eq!(encoded.token_ids, vec![1, 2, 3, -1, 2, 2]);
        assert_eq!(encoded.weights, vec![1.0, 1.0, 1.0, 0.0, 1.0, 1.0]);

        let loaded = encode_split(
            &store, &coord, &dataset, &encoder, &token_path, &weight_path, true, false, "text",
        )
        .unwrap();
        assert_eq!(loaded.token_ids, encoded.token_ids);
        assert_eq!(loaded.weights, encoded.weights);
    }

    #[test]
    fn test_load_missing_artifact_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new();
        let dataset = ToyDataset {
            rows: vec![vec![1]],
        };
        let encoder = UnitEncoder { token_len: 1 };
        let err = encode_split(
            &store,
            &SingleProcess,
            &dataset,
            &encoder,
            &dir.path().join("missing.mmp"),
            &dir.path().join("missing2.mmp"),
            true,
            false,
            "text",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ArtifactMissing(_)));
    }

    #[test]
    fn test_encoder_shape_violation_is_fatal() {
        struct BadEncoder;
        impl Encoder<Vec<i32>> for BadEncoder {
            fn token_len(&self) -> usize {
                4
            }
            fn weight_dim(&self) -> usize {
                1
            }
            fn encode_step(&self, record: &Vec<i32>) -> EncodedRecord {
                EncodedRecord {
                    token_ids: record.clone(), // wrong width
                    weights: vec![0.0; 4],
                }
            }
        }

        let dir = TempDir::new().unwrap();
        let dataset = ToyDataset {
            rows: vec![vec![1, 2]],
        };
        let err = encode_split(
            &ArtifactStore::new(),
            &SingleProcess,
            &dataset,
            &BadEncoder,
            &dir.path().join("t.mmp"),
            &dir.path().join("w.mmp"),
            false,
            false,
            "text",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_gate_keeps_top_k_per_row() {
        let mut weights = vec![
            0.1, 0.9, 0.5, //
            0.7, 0.2, 0.7,
        ];
        gate_weights(&mut weights, 3, 1);
        assert_eq!(weights, vec![0.0, 0.9, 0.0, 0.7, 0.0, 0.0]);
    }

    #[test]
    fn test_gate_disabled_or_oversized_is_noop() {
        let original = vec![0.3, 0.2, 0.1];
        let mut weights = original.clone();
        gate_weights(&mut weights, 3, 0);
        assert_eq!(weights, original);
        gate_weights(&mut weights, 3, 5);
        assert_eq!(weights, original);
    }
}

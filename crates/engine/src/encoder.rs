//! External collaborator surfaces: datasets and encoders
//!
//! The pipeline never sees raw records or model weights; it drives these
//! traits and owns only the encoded arrays that come back. The generative
//! backend's model surfaces (`NextTokenScorer`, `SequenceScorer`) live in
//! `quarry-beam`.

/// A dataset addressable by row index
///
/// Iteration within an assigned shard range must be stable: the same index
/// always yields the same record, so every rank agrees on row identity.
pub trait Dataset {
    /// Record type handed to the encoder
    type Record;

    /// Total rows
    fn len(&self) -> usize;

    /// True when the dataset holds no rows
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The record at `idx`
    fn get(&self, idx: usize) -> Self::Record;
}

/// One encoded record: fixed-width token ids plus weights
///
/// Sparse encoders emit one weight per token slot (`weight_dim == 1`);
/// dense encoders emit a single embedding row (`token_len == 1`,
/// `weight_dim == D`).
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRecord {
    /// `token_len` token ids; negative values are padding
    pub token_ids: Vec<i32>,
    /// `token_len * weight_dim` weights or embedding values
    pub weights: Vec<f32>,
}

/// Deterministic record encoder
///
/// Given fixed model weights, `encode_step` must be a pure function of the
/// record, so re-encoding a shard reproduces the cached artifact.
pub trait Encoder<R> {
    /// Token slots per record
    fn token_len(&self) -> usize;

    /// Weight values per token slot
    fn weight_dim(&self) -> usize;

    /// Encode one record
    fn encode_step(&self, record: &R) -> EncodedRecord;
}

//! Constrained generative retrieval for quarry
//!
//! Token-level search restricted to the paths of a code trie: the external
//! model proposes next-token log-probabilities, the trie says which tokens
//! are legal, and decoding keeps the `nbeam` best (or sampled)
//! continuations until every beam completes. Completed beams map to the
//! documents reachable at their final trie node.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decode;

use quarry_core::{QueryId, TokenId};

pub use decode::decode;

// ============================================================================
// External model surface
// ============================================================================

/// Next-token distribution supplier, conditioned on the query
///
/// Implemented by the (external) generative model. Must be deterministic
/// given fixed weights and inputs.
pub trait NextTokenScorer {
    /// Size of the code vocabulary the scorer distributes over
    fn vocab_size(&self) -> usize;

    /// Log-probabilities over the vocabulary for the token following
    /// `prefix`, when generating for `query`
    fn log_probs(&self, query: QueryId, prefix: &[TokenId]) -> Vec<f32>;
}

/// Whole-sequence scorer used when ranking should not come from raw
/// generation probability (e.g. a learned head over final hidden states)
pub trait SequenceScorer {
    /// Score a completed code sequence for `query`; higher is better
    fn score_sequence(&self, query: QueryId, tokens: &[TokenId]) -> f32;
}

// ============================================================================
// Options
// ============================================================================

/// Sampling controls, used when decoding samples instead of keeping the
/// top continuations
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Keep only the `k` most probable tokens per beam; `0` disables
    pub top_k: usize,
    /// Nucleus filtering: smallest token set with cumulative mass `p`
    pub top_p: Option<f32>,
    /// Typical filtering: tokens whose surprisal is nearest the entropy
    pub typical_p: Option<f32>,
    /// Softmax temperature; values below 1 sharpen the distribution
    pub temperature: f32,
    /// Base seed; each query derives its own reproducible stream
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams {
            top_k: 0,
            top_p: None,
            typical_p: None,
            temperature: 1.0,
            seed: 42,
        }
    }
}

/// How continuations are chosen each step
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeStrategy {
    /// Keep the `nbeam` highest cumulative log-probabilities
    Beam,
    /// Sample `nbeam` continuations under the given controls
    Sample(SamplingParams),
}

/// Where a completed beam's ranking score comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreSource {
    /// Raw cumulative sequence log-probability
    LogProb,
    /// An external [`SequenceScorer`]
    Sequence,
}

/// Per-query decoding controls
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Beams kept live per query
    pub nbeam: usize,
    /// Hard cap on generated tokens per beam
    pub max_new_tokens: usize,
    /// Freeze a beam once its node reaches fewer than this many documents;
    /// `0` disables early stopping
    pub threshold: usize,
    /// Earliest generated length at which freezing may trigger
    pub trsd_start_len: usize,
    /// Top-continuation or sampled selection
    pub strategy: DecodeStrategy,
    /// Ranking score source for completed beams
    pub score_source: ScoreSource,
    /// Re-normalize log-probabilities over each beam's allowed token set
    pub renormalize: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            nbeam: 10,
            max_new_tokens: 16,
            threshold: 0,
            trsd_start_len: 0,
            strategy: DecodeStrategy::Beam,
            score_source: ScoreSource::LogProb,
            renormalize: false,
        }
    }
}

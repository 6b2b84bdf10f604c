//! Run configuration
//!
//! Plain serde structs with defaults, loaded once (from a JSON file or
//! built in code) and read-only afterwards. `validate` is called a single
//! time before the pipeline starts; everything downstream may assume a
//! coherent configuration.

use quarry_core::{Error, Result, TokenId};
use quarry_beam::{DecodeOptions, DecodeStrategy, SamplingParams, ScoreSource};
use quarry_index::{IndexKind, VectorMetric};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration for one retrieval run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory of all cached artifacts
    pub cache_root: PathBuf,
    /// Model name; namespaces every artifact path
    pub model: String,
    /// Corpus-side encoding variant
    #[serde(default = "default_variant")]
    pub text_variant: String,
    /// Query set being evaluated
    #[serde(default = "default_eval_set")]
    pub eval_set: String,
    /// Stem of the final result file
    #[serde(default = "default_result_name")]
    pub result_name: String,
    /// Candidates kept per query; `0` keeps everything, unordered
    #[serde(default = "default_hits")]
    pub hits: usize,
    /// Also write the `_with_scores` result variant
    #[serde(default)]
    pub save_scores: bool,
    /// Encoding phase controls
    #[serde(default)]
    pub encode: EncodeConfig,
    /// Index backend selection and knobs
    pub index: IndexConfig,
    /// Second-pass verification
    #[serde(default)]
    pub verifier: VerifierConfig,
    /// Constrained decoding controls (trie backend)
    #[serde(default)]
    pub beam: BeamConfig,
}

fn default_variant() -> String {
    "default".to_string()
}

fn default_eval_set() -> String {
    "dev".to_string()
}

fn default_result_name() -> String {
    "retrieval".to_string()
}

fn default_hits() -> usize {
    10
}

/// Encoding phase controls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodeConfig {
    /// Skip encoding and map the cached artifacts instead
    #[serde(default)]
    pub load_encode: bool,
    /// Write encoded shards into the cache artifacts
    #[serde(default)]
    pub save_encode: bool,
    /// Keep only the top-k token weights per document row before
    /// indexing (sparse backends); `0` disables gating
    #[serde(default)]
    pub gate_k: usize,
}

/// Index backend selection and construction knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Backend variant
    pub kind: IndexKind,
    /// Reload a persisted index instead of fitting
    #[serde(default)]
    pub load_index: bool,
    /// Persist the fitted index
    #[serde(default)]
    pub save_index: bool,
    /// Vocabulary size (inverted)
    #[serde(default)]
    pub vocab_size: usize,
    /// Token ids excluded from posting lists (inverted)
    #[serde(default)]
    pub special_tokens: Vec<TokenId>,
    /// Parallel construction slices
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Posting weight floor; `0.0` disables (inverted)
    #[serde(default)]
    pub prune_weight: f32,
    /// Posting list cap; `0` disables (inverted)
    #[serde(default)]
    pub prune_len: usize,
    /// Similarity metric (vector)
    #[serde(default = "default_metric")]
    pub metric: VectorMetric,
    /// Centroid count (ivf)
    #[serde(default = "default_nlist")]
    pub nlist: usize,
    /// Buckets probed per query (ivf)
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    /// K-means refinement iterations (ivf)
    #[serde(default = "default_train_iters")]
    pub train_iters: usize,
    /// Seed for deterministic training (ivf)
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Code family the trie is built from (trie)
    #[serde(default = "default_code_kind")]
    pub code_kind: String,
    /// Code row width, start marker and padding included (trie)
    #[serde(default = "default_code_len")]
    pub code_len: usize,
}

fn default_shards() -> usize {
    8
}

fn default_metric() -> VectorMetric {
    VectorMetric::InnerProduct
}

fn default_nlist() -> usize {
    64
}

fn default_nprobe() -> usize {
    8
}

fn default_train_iters() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

fn default_code_kind() -> String {
    "cluster".to_string()
}

fn default_code_len() -> usize {
    8
}

/// Verifier selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    /// No verification
    None,
    /// Exact re-scoring over full embeddings
    Flat,
    /// Product-quantized re-scoring
    Pq,
}

/// Second-pass verification controls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Verifier variant
    #[serde(default = "default_verifier_kind")]
    pub kind: VerifierKind,
    /// Cutoff after re-scoring; must not exceed the index cutoff
    #[serde(default = "default_hits")]
    pub hits: usize,
    /// Model whose cached embeddings/codes the verifier reads; empty
    /// means the run's own model
    #[serde(default)]
    pub src: String,
    /// Embedding width of the verifier's embeddings
    #[serde(default)]
    pub dim: usize,
}

fn default_verifier_kind() -> VerifierKind {
    VerifierKind::None
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            kind: VerifierKind::None,
            hits: default_hits(),
            src: String::new(),
            dim: 0,
        }
    }
}

/// Constrained decoding controls, mapped onto [`DecodeOptions`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamConfig {
    /// Beams kept live per query
    #[serde(default = "default_nbeam")]
    pub nbeam: usize,
    /// Hard cap on generated tokens
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Early-stop document threshold; `0` disables
    #[serde(default)]
    pub threshold: usize,
    /// Earliest length at which early stop may trigger
    #[serde(default)]
    pub trsd_start_len: usize,
    /// Sample continuations instead of keeping the top ones
    #[serde(default)]
    pub do_sample: bool,
    /// Top-k sampling filter; `0` disables
    #[serde(default)]
    pub top_k: usize,
    /// Nucleus sampling filter
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Typical sampling filter
    #[serde(default)]
    pub typical_p: Option<f32>,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Sampling seed
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Rank completed beams by an external sequence scorer instead of
    /// generation probability
    #[serde(default)]
    pub rank_by_sequence: bool,
    /// Re-normalize log-probabilities over each beam's allowed tokens
    #[serde(default)]
    pub renormalize: bool,
}

fn default_nbeam() -> usize {
    10
}

fn default_max_new_tokens() -> usize {
    16
}

fn default_temperature() -> f32 {
    1.0
}

impl Default for BeamConfig {
    fn default() -> Self {
        BeamConfig {
            nbeam: default_nbeam(),
            max_new_tokens: default_max_new_tokens(),
            threshold: 0,
            trsd_start_len: 0,
            do_sample: false,
            top_k: 0,
            top_p: None,
            typical_p: None,
            temperature: default_temperature(),
            seed: default_seed(),
            rank_by_sequence: false,
            renormalize: false,
        }
    }
}

impl BeamConfig {
    /// The decode options this configuration describes
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            nbeam: self.nbeam,
            max_new_tokens: self.max_new_tokens,
            threshold: self.threshold,
            trsd_start_len: self.trsd_start_len,
            strategy: if self.do_sample {
                DecodeStrategy::Sample(SamplingParams {
                    top_k: self.top_k,
                    top_p: self.top_p,
                    typical_p: self.typical_p,
                    temperature: self.temperature,
                    seed: self.seed,
                })
            } else {
                DecodeStrategy::Beam
            },
            score_source: if self.rank_by_sequence {
                ScoreSource::Sequence
            } else {
                ScoreSource::LogProb
            },
            renormalize: self.renormalize,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: EngineConfig =
            serde_json::from_str(&text).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The verifier source model, defaulting to the run's own model
    pub fn verifier_src(&self) -> &str {
        if self.verifier.src.is_empty() {
            &self.model
        } else {
            &self.verifier.src
        }
    }

    /// Check cross-field coherence once, before the run starts
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(Error::InvalidOperation("model name must not be empty".into()));
        }
        if self.index.kind == IndexKind::Inverted && self.index.vocab_size == 0 {
            return Err(Error::InvalidOperation(
                "inverted index needs a nonzero vocab_size".into(),
            ));
        }
        if self.verifier.kind != VerifierKind::None {
            if self.hits > 0 && self.verifier.hits > self.hits {
                return Err(Error::InvalidOperation(format!(
                    "verifier hits {} exceeds index hits {}",
                    self.verifier.hits, self.hits
                )));
            }
            if self.verifier.dim == 0 {
                return Err(Error::InvalidOperation(
                    "verifier needs the embedding dim of its source".into(),
                ));
            }
        }
        if self.index.kind == IndexKind::Trie && self.beam.nbeam == 0 {
            return Err(Error::InvalidOperation(
                "constrained decoding needs at least one beam".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(kind: IndexKind) -> EngineConfig {
        EngineConfig {
            cache_root: PathBuf::from("/tmp/cache"),
            model: "test-model".to_string(),
            text_variant: default_variant(),
            eval_set: default_eval_set(),
            result_name: default_result_name(),
            hits: 10,
            save_scores: false,
            encode: EncodeConfig::default(),
            index: IndexConfig {
                kind,
                load_index: false,
                save_index: false,
                vocab_size: 100,
                special_tokens: vec![],
                shards: default_shards(),
                prune_weight: 0.0,
                prune_len: 0,
                metric: default_metric(),
                nlist: default_nlist(),
                nprobe: default_nprobe(),
                train_iters: default_train_iters(),
                seed: default_seed(),
                code_kind: default_code_kind(),
                code_len: default_code_len(),
            },
            verifier: VerifierConfig::default(),
            beam: BeamConfig::default(),
        }
    }

    #[test]
    fn test_validate_accepts_coherent_config() {
        base_config(IndexKind::Inverted).validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_vocab_for_inverted() {
        let mut config = base_config(IndexKind::Inverted);
        config.index.vocab_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_verifier_hits_above_hits() {
        let mut config = base_config(IndexKind::Flat);
        config.verifier.kind = VerifierKind::Flat;
        config.verifier.dim = 4;
        config.verifier.hits = 50;
        assert!(config.validate().is_err());

        config.verifier.hits = 5;
        config.validate().unwrap();
    }

    #[test]
    fn test_verifier_src_falls_back_to_model() {
        let mut config = base_config(IndexKind::Flat);
        assert_eq!(config.verifier_src(), "test-model");
        config.verifier.src = "dense-teacher".to_string();
        assert_eq!(config.verifier_src(), "dense-teacher");
    }

    #[test]
    fn test_json_defaults_fill_in() {
        let json = r#"{
            "cache_root": "/tmp/cache",
            "model": "m",
            "index": { "kind": "flat" }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hits, 10);
        assert_eq!(config.eval_set, "dev");
        assert_eq!(config.index.nprobe, 8);
        assert_eq!(config.verifier.kind, VerifierKind::None);
        config.validate().unwrap();
    }

    #[test]
    fn test_beam_config_maps_to_decode_options() {
        let mut beam = BeamConfig {
            nbeam: 4,
            threshold: 3,
            trsd_start_len: 2,
            ..Default::default()
        };
        let opts = beam.decode_options();
        assert_eq!(opts.nbeam, 4);
        assert!(matches!(opts.strategy, DecodeStrategy::Beam));

        beam.do_sample = true;
        beam.top_k = 5;
        let opts = beam.decode_options();
        match opts.strategy {
            DecodeStrategy::Sample(params) => assert_eq!(params.top_k, 5),
            _ => panic!("expected sampling strategy"),
        }
    }
}

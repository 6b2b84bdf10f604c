//! Quarry - distributed retrieval research engine
//!
//! Quarry encodes documents and queries into sparse token weights, dense
//! vectors, or discrete codes, builds one of three index backends over
//! them, runs top-k retrieval, and optionally re-scores candidates with a
//! more expensive verifier. Runs span cooperating worker processes that
//! shard the corpus and queries and agree on race-free results through
//! on-disk artifacts, lock tokens, and barrier synchronization.
//!
//! # Quick Start
//!
//! ```ignore
//! use quarry::{EngineConfig, RetrievalPipeline, SingleProcess};
//!
//! let config = EngineConfig::from_json_file("quarry.json".as_ref())?;
//! let coord = SingleProcess;
//! let pipeline = RetrievalPipeline::new(&config, &coord)?;
//!
//! // datasets and encoders are the caller's model-specific collaborators
//! let result = pipeline.retrieve(&corpus, &encoder, &queries, &encoder)?;
//! ```
//!
//! # Architecture
//!
//! - [`quarry_core`]: shared types, shard ranges, errors
//! - [`quarry_store`]: sharded memmap artifacts, lock tokens, cache layout
//! - [`quarry_comm`]: barrier/all-gather/broadcast across worker processes
//! - [`quarry_index`]: inverted, vector, and trie backends plus the verifier
//! - [`quarry_beam`]: trie-constrained decoding
//! - [`quarry_engine`]: configuration and the pipeline itself

// Re-export the crates behind one facade
pub use quarry_beam::{
    decode, DecodeOptions, DecodeStrategy, NextTokenScorer, SamplingParams, ScoreSource,
    SequenceScorer,
};
pub use quarry_comm::{Coordinator, FsCoordinator, SingleProcess};
pub use quarry_core::{
    ArraySpec, DocId, Dtype, Error, QueryId, Result, ResultMap, ScoredDoc, ShardRange, TokenId,
};
pub use quarry_engine::{
    Dataset, EncodedRecord, Encoder, EngineConfig, Metrics, ResultMerger, RetrievalPipeline,
    VerifierKind,
};
pub use quarry_index::{
    IndexBackend, IndexKind, InvertedIndex, QueryBatch, SearchStats, TrieIndex, VectorIndex,
    VectorMetric, Verifier,
};
pub use quarry_store::{ArtifactStore, BuildLock, CacheLayout};

//! Pipeline orchestration for quarry
//!
//! This crate provides:
//! - `EngineConfig`: run configuration with defaults and one-time validation
//! - `Dataset` / `Encoder`: the narrow surfaces external collaborators implement
//! - the sharded encode phase writing cache artifacts
//! - `RetrievalPipeline`: encode → fit → search → verify → merge → persist
//! - `ResultMerger` and result-file persistence

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod encode;
pub mod encoder;
pub mod merge;
pub mod pipeline;

pub use config::{BeamConfig, EncodeConfig, EngineConfig, IndexConfig, VerifierConfig, VerifierKind};
pub use encode::{encode_split, gate_weights, EncodeOutput};
pub use encoder::{Dataset, EncodedRecord, Encoder};
pub use merge::{
    load_result_ids, load_result_scores, save_result_ids, save_result_scores, ResultMerger,
};
pub use pipeline::{Metrics, RetrievalPipeline};

//! Shared types for the quarry retrieval engine
//!
//! This crate holds the vocabulary every other quarry crate speaks:
//! identifier types, array layout specs, shard ranges, ranked results,
//! and the error enum.
//!
//! No I/O lives here; everything is plain data.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod shard;
pub mod types;

pub use error::{Error, Result};
pub use shard::ShardRange;
pub use types::{
    ArraySpec, DocId, Dtype, QueryId, ResultMap, ScoredDoc, TokenId, CODE_PAD,
};

//! Sharded artifact storage for quarry
//!
//! This crate provides:
//! - `ArtifactStore`: typed, shape-addressed binary arrays on disk,
//!   range-written by multiple worker processes
//! - `BuildLock`: the poll-based lock-token protocol guarding creation
//! - `CacheLayout`: the stable on-disk path scheme
//!
//! Cross-process sharing goes through the filesystem only; there are no
//! shared in-memory structures here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod layout;
pub mod lock;
pub mod store;

pub use layout::{CacheLayout, CODES_FILE, EMBEDDINGS_FILE, TOKEN_IDS_FILE};
pub use lock::{BuildLock, LOCK_FILE_NAME, LOCK_POLL_INTERVAL};
pub use store::{ArtifactMap, ArtifactStore};

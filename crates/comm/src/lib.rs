//! Cross-process coordination for quarry
//!
//! This crate provides:
//! - The `Coordinator` trait: rank/world-size model, barrier, all-gather,
//!   broadcast, with ordering guaranteed by ascending rank
//! - `SingleProcess`: the degenerate world-size-1 instance
//! - `FsCoordinator`: filesystem rendezvous for multi-process runs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod fs;
pub mod single;

pub use coordinator::Coordinator;
pub use fs::FsCoordinator;
pub use single::SingleProcess;

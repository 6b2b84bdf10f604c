//! Error types for the quarry retrieval engine
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for quarry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the quarry retrieval engine
///
/// Storage/layout errors are fatal and propagate uncaught to the pipeline
/// entry point; data-content anomalies are reported via warnings at the call
/// site and never reach this enum.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, rendezvous directory, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// On-disk artifact does not match the expected shape/dtype
    #[error("Shape mismatch for {path:?}: expected {expected} bytes, found {actual}")]
    ShapeMismatch {
        /// Artifact path
        path: PathBuf,
        /// Byte size implied by the declared shape and dtype
        expected: u64,
        /// Byte size found on disk
        actual: u64,
    },

    /// A required artifact is missing
    #[error("Required artifact not found: {0:?}")]
    ArtifactMissing(PathBuf),

    /// Corpus size disagrees with the artifact row count during `fit`
    #[error("Corpus size mismatch: index expects {expected} documents, artifact holds {actual}")]
    CorpusSizeMismatch {
        /// Document count the index was configured for
        expected: usize,
        /// Row count of the artifact handed to `fit`
        actual: usize,
    },

    /// Data corruption detected (bad magic, failed checksum)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Selected index/verifier variant is not implemented
    #[error("Unsupported selection: {0}")]
    Unsupported(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_display_shape_mismatch() {
        let err = Error::ShapeMismatch {
            path: PathBuf::from("/cache/encode/text_embeddings.mmp"),
            expected: 4096,
            actual: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("text_embeddings.mmp"));
    }

    #[test]
    fn test_error_display_corpus_size_mismatch() {
        let err = Error::CorpusSizeMismatch {
            expected: 100,
            actual: 99,
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("99"));
    }

    #[test]
    fn test_error_from_bincode() {
        let invalid = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = bincode::deserialize(&invalid).map_err(|e| e.into());
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_error_pattern_matching() {
        let err = Error::CorpusSizeMismatch {
            expected: 10,
            actual: 11,
        };
        match err {
            Error::CorpusSizeMismatch { expected, actual } => {
                assert_eq!(expected, 10);
                assert_eq!(actual, 11);
            }
            _ => panic!("Wrong error variant"),
        }
    }
}

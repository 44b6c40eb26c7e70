//! Error types for the romdepot library
//!
//! This module defines all error types that can occur during depot, index
//! and harness operations. Errors carry enough context (usually a path or a
//! key width) to be actionable in logs.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the romdepot library
pub type Result<T> = std::result::Result<T, DepotError>;

/// Main error type for all romdepot operations
#[derive(Debug, Error)]
pub enum DepotError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory walk error from the walkdir crate
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// Zip container error
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Errors during bincode serialization/deserialization
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A path that does not decode as a sharded depot blob path
    #[error("malformed depot path: {0:?}")]
    MalformedPath(PathBuf),

    /// A depot blob too short to carry its hash trailer
    #[error("malformed depot blob: {0:?}")]
    MalformedBlob(PathBuf),

    /// Depot admission refused: every root is at or above its cap
    #[error("depot ran out of disk space (needed {needed} bytes)")]
    OutOfSpace {
        /// Size of the reservation that could not be placed
        needed: u64,
    },

    /// A rom lacking a SHA1 where one is required
    #[error("rom {0} is missing its SHA1")]
    HashMissing(String),

    /// A key passed to a store whose fixed key width differs
    #[error("key size mismatch: store expects {expected} bytes, got {actual}")]
    KeySize {
        /// Fixed key width of the store
        expected: usize,
        /// Width of the offending key
        actual: usize,
    },

    /// Invalid configuration (empty backup dir, unreadable resume log, ...)
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Key/value store failures that are not plain I/O
    #[error("store error: {0}")]
    Storage(String),
}

// bincode 2.x splits encode and decode error types; fold both into Encoding.
impl From<bincode::error::EncodeError> for DepotError {
    fn from(err: bincode::error::EncodeError) -> Self {
        DepotError::Encoding(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for DepotError {
    fn from(err: bincode::error::DecodeError) -> Self {
        DepotError::Encoding(err.to_string())
    }
}

impl DepotError {
    /// Create a storage error with a custom message
    pub fn storage(msg: impl Into<String>) -> Self {
        DepotError::Storage(msg.into())
    }

    /// Create an invalid-configuration error with a custom message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        DepotError::InvalidConfig(msg.into())
    }

    /// Check if this error ruins a single item rather than the whole run
    ///
    /// Per-item errors are logged by the harness and the walk continues;
    /// everything else aborts the current operation.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            DepotError::Io(_)
                | DepotError::Zip(_)
                | DepotError::MalformedPath(_)
                | DepotError::MalformedBlob(_)
                | DepotError::HashMissing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DepotError::HashMissing("pacman.bin".to_string());
        assert_eq!(err.to_string(), "rom pacman.bin is missing its SHA1");

        let err = DepotError::KeySize {
            expected: 20,
            actual: 16,
        };
        assert_eq!(
            err.to_string(),
            "key size mismatch: store expects 20 bytes, got 16"
        );
    }

    #[test]
    fn test_per_item_classification() {
        assert!(DepotError::MalformedPath(PathBuf::from("/x")).is_per_item());
        assert!(!DepotError::OutOfSpace { needed: 42 }.is_per_item());
        assert!(!DepotError::invalid_config("no backup dir").is_per_item());
    }
}

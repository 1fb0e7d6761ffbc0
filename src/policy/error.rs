//! Error types for policy loading and persistence.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Failed to read a policy file.
    #[error("failed to read {path:?}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a policy file.
    #[error("failed to write {path:?}: {source}")]
    Write {
        /// Path that failed to write.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The on-disk policy is not a JSON object.
    #[error("policy file {path:?} is not a JSON object")]
    NotAnObject {
        /// Offending path.
        path: PathBuf,
    },

    /// Policy JSON failed to parse.
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// An ignore pattern could not be compiled.
    #[error("invalid ignore pattern: {0}")]
    IgnorePattern(#[from] ignore::Error),
}

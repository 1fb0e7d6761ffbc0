//! Error types for origin servers.

use thiserror::Error;

/// Unified error type for starting and running origins.
#[derive(Debug, Error)]
pub enum OriginError {
    /// Socket binding or accept failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free local port available.
    #[error(transparent)]
    Port(#[from] crate::netutil::NetUtilError),
}

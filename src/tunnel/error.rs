//! Error types for the tunnel supervisor.

use thiserror::Error;

/// Unified error type for tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The agent binary could not be resolved.
    #[error("tunnel agent not found: {0}")]
    AgentNotFound(String),

    /// Spawning the agent failed.
    #[error("failed to spawn tunnel agent: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The agent produced no valid URL within the readiness timeout.
    #[error("timed_out_waiting_for_url")]
    ReadyTimeout,

    /// The agent exited before announcing a URL.
    #[error("tunnel agent exited before publishing a URL{0}")]
    PrematureExit(String),

    /// All spawn attempts failed.
    #[error("tunnel startup failed after {attempts} attempt(s): {last}")]
    Startup {
        /// Number of attempts made.
        attempts: u32,
        /// The last attempt's error message.
        last: String,
    },
}

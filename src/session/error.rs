//! The public error taxonomy.
//!
//! Every operation failure surfaces as one of these kinds. HTTP-surface
//! denials (`unauthorized`, `rate_limited`, `path_not_allowed`,
//! `invalid_range`) are emitted as JSON bodies by the origins and never
//! appear here.

use thiserror::Error;

/// Errors surfaced by the public operations.
#[derive(Debug, Error)]
pub enum ExposeError {
    /// The caller supplied malformed or out-of-range input.
    #[error("invalid_input: {0}")]
    InvalidInput(String),

    /// The input conflicts with policy (blocked port, ignored path,
    /// outside allowed roots).
    #[error("policy_violation: {0}")]
    PolicyViolation(String),

    /// No session with the given id.
    #[error("not_found: {0}")]
    NotFound(String),

    /// Nothing is listening on the local port to expose.
    #[error("local_unreachable: no service listening on 127.0.0.1:{0}")]
    LocalUnreachable(u16),

    /// The tunnel agent binary could not be resolved.
    #[error("agent_not_found: {0}")]
    AgentNotFound(String),

    /// The tunnel agent failed to come up within bounds.
    #[error("tunnel_startup_failure: {0}")]
    TunnelStartup(String),

    /// Anything unexpected.
    #[error("internal_error: {0}")]
    Internal(String),
}

impl ExposeError {
    /// The machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            ExposeError::InvalidInput(_) => "invalid_input",
            ExposeError::PolicyViolation(_) => "policy_violation",
            ExposeError::NotFound(_) => "not_found",
            ExposeError::LocalUnreachable(_) => "local_unreachable",
            ExposeError::AgentNotFound(_) => "agent_not_found",
            ExposeError::TunnelStartup(_) => "tunnel_startup_failure",
            ExposeError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(ExposeError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(ExposeError::NotFound("id".into()).kind(), "not_found");
        assert_eq!(ExposeError::LocalUnreachable(80).kind(), "local_unreachable");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = ExposeError::PolicyViolation("port blocked by policy: 22".into());
        assert!(err.to_string().contains("port blocked by policy: 22"));
    }
}

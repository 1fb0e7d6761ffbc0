//! Tunnel supervisor.
//!
//! Owns the external quick-tunnel agent: spawn with policy-derived
//! arguments, line-buffered output capture, readiness detection, bounded
//! retry, and SIGTERM/SIGKILL termination.

mod error;
mod supervisor;
mod url;

pub use error::TunnelError;
pub use supervisor::{
    agent_version, resolve_agent, start_tunnel, terminate, TunnelHandle, TunnelSettings,
    DEFAULT_AGENT, DEFAULT_ATTEMPTS, READY_TIMEOUT,
};
pub use url::extract_quick_tunnel_url;

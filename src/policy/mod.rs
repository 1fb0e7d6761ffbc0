//! Policy & ignore store.
//!
//! - **Schema**: typed policy with clamped numerics and validated enums
//! - **Loader**: three-layer merge (defaults → runtime patch → `policy.json`)
//! - **Ignore**: `.gitignore`-semantics matcher over built-ins,
//!   `policy.ignore`, and the CWD's `.gitignore`

mod error;
mod ignore;
mod loader;
mod schema;

pub use error::PolicyError;
pub use ignore::IgnoreMatcher;
pub use loader::{LoadedPolicy, PolicyLoader, POLICY_FILE, POLICY_IGNORE_FILE};
pub use schema::{
    sanitize_patch, AccessMode, EdgeIpVersion, Policy, PolicyPatch, RateLimitPolicy,
    RateLimitPolicyPatch, TunnelPolicy, TunnelPolicyPatch, TunnelProtocol, MIN_TTL_SECONDS,
};

//! Typed policy schema with clamping and validated enums.
//!
//! The effective policy is assembled from three layers, highest priority
//! first: the on-disk `policy.json` patch, the process-wide runtime patch,
//! and the built-in defaults. Nested objects (`tunnel`, `rate_limit`) merge
//! deeply; lists (`blocked_ports`, `allowed_path_roots`) are replaced
//! wholesale by the higher layer. After merging, numeric fields are clamped
//! into their documented bounds and invalid enum strings fall back to their
//! defaults with a warning.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lower bound on any TTL, seconds.
pub const MIN_TTL_SECONDS: u64 = 60;

/// Bounds on the rate-limit window, milliseconds.
pub const WINDOW_MS_BOUNDS: (u64, u64) = (1_000, 3_600_000);

/// Bounds on the per-window request cap.
pub const MAX_REQUESTS_BOUNDS: (u64, u64) = (1, 100_000);

const fn default_ttl_seconds() -> u64 {
    3_600
}

const fn default_max_ttl_seconds() -> u64 {
    86_400
}

fn default_blocked_ports() -> BTreeSet<u16> {
    [22, 23, 25, 445, 3389].into_iter().collect()
}

/// Access mode applied to an exposure's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Bearer/query/header token.
    Token,
    /// HTTP basic auth with a generated password.
    Basic,
    /// No origin-side authentication.
    None,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Token => write!(f, "token"),
            AccessMode::Basic => write!(f, "basic"),
            AccessMode::None => write!(f, "none"),
        }
    }
}

impl AccessMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "token" => Some(AccessMode::Token),
            "basic" => Some(AccessMode::Basic),
            "none" => Some(AccessMode::None),
            _ => None,
        }
    }
}

/// Edge IP version handed to the tunnel agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum EdgeIpVersion {
    /// IPv4 edges only.
    #[serde(rename = "4")]
    V4,
    /// IPv6 edges only.
    #[serde(rename = "6")]
    V6,
    /// Let the agent pick.
    #[serde(rename = "auto")]
    Auto,
}

impl EdgeIpVersion {
    /// The value passed on the agent command line.
    pub fn as_arg(&self) -> &'static str {
        match self {
            EdgeIpVersion::V4 => "4",
            EdgeIpVersion::V6 => "6",
            EdgeIpVersion::Auto => "auto",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "4" => Some(EdgeIpVersion::V4),
            "6" => Some(EdgeIpVersion::V6),
            "auto" => Some(EdgeIpVersion::Auto),
            _ => None,
        }
    }
}

/// Transport protocol handed to the tunnel agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    /// HTTP/2 transport.
    Http2,
    /// QUIC transport.
    Quic,
    /// Let the agent pick.
    Auto,
}

impl TunnelProtocol {
    /// The value passed on the agent command line.
    pub fn as_arg(&self) -> &'static str {
        match self {
            TunnelProtocol::Http2 => "http2",
            TunnelProtocol::Quic => "quic",
            TunnelProtocol::Auto => "auto",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "http2" => Some(TunnelProtocol::Http2),
            "quic" => Some(TunnelProtocol::Quic),
            "auto" => Some(TunnelProtocol::Auto),
            _ => None,
        }
    }
}

/// Tunnel agent tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelPolicy {
    /// Edge IP version (`4`, `6`, `auto`).
    pub edge_ip_version: EdgeIpVersion,
    /// Transport protocol (`http2`, `quic`, `auto`).
    pub protocol: TunnelProtocol,
}

impl Default for TunnelPolicy {
    fn default() -> Self {
        Self {
            edge_ip_version: EdgeIpVersion::Auto,
            protocol: TunnelProtocol::Auto,
        }
    }
}

/// Per-IP origin rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitPolicy {
    /// Master switch.
    pub enabled: bool,
    /// Window length in milliseconds, clamped to [1000, 3_600_000].
    pub window_ms: u64,
    /// Per-IP request cap per window, clamped to [1, 100_000].
    pub max_requests: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 60_000,
            max_requests: 300,
        }
    }
}

/// The effective, validated policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Policy {
    /// TTL applied when the caller does not supply one.
    pub default_ttl_seconds: u64,
    /// Upper bound on any session TTL.
    pub max_ttl_seconds: u64,
    /// Default access mode for port exposures.
    pub default_expose_port_access: AccessMode,
    /// Default access mode for file exposures.
    pub default_expose_files_access: AccessMode,
    /// Ports that may never be exposed.
    pub blocked_ports: BTreeSet<u16>,
    /// If non-empty, exposure inputs must be contained in one of these roots.
    pub allowed_path_roots: Vec<PathBuf>,
    /// Tunnel agent tuning.
    pub tunnel: TunnelPolicy,
    /// Origin rate limiting.
    pub rate_limit: RateLimitPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_ttl_seconds(),
            max_ttl_seconds: default_max_ttl_seconds(),
            default_expose_port_access: AccessMode::Token,
            default_expose_files_access: AccessMode::Token,
            blocked_ports: default_blocked_ports(),
            allowed_path_roots: Vec::new(),
            tunnel: TunnelPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

impl Policy {
    /// Clamp a requested TTL into `[MIN_TTL_SECONDS, max_ttl_seconds]`.
    pub fn clamp_ttl(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_ttl_seconds)
            .clamp(MIN_TTL_SECONDS, self.max_ttl_seconds)
    }

    /// Default access mode for the given exposure kind.
    pub fn default_access(&self, files: bool) -> AccessMode {
        if files {
            self.default_expose_files_access
        } else {
            self.default_expose_port_access
        }
    }

    /// Clamp numeric fields into their documented bounds after a merge.
    pub fn clamp(&mut self) {
        self.max_ttl_seconds = self.max_ttl_seconds.max(MIN_TTL_SECONDS);
        self.default_ttl_seconds = self
            .default_ttl_seconds
            .clamp(MIN_TTL_SECONDS, self.max_ttl_seconds);
        self.rate_limit.window_ms = self
            .rate_limit
            .window_ms
            .clamp(WINDOW_MS_BOUNDS.0, WINDOW_MS_BOUNDS.1);
        self.rate_limit.max_requests = self
            .rate_limit
            .max_requests
            .clamp(MAX_REQUESTS_BOUNDS.0, MAX_REQUESTS_BOUNDS.1);
    }

    /// Apply a sanitized patch on top of this policy.
    ///
    /// Scalars and lists are replaced; `tunnel` and `rate_limit` merge field
    /// by field. Callers sanitize the patch first (see [`sanitize_patch`])
    /// so enum fields are guaranteed to deserialize.
    pub fn apply(&mut self, patch: PolicyPatch) {
        if let Some(v) = patch.default_ttl_seconds {
            self.default_ttl_seconds = v;
        }
        if let Some(v) = patch.max_ttl_seconds {
            self.max_ttl_seconds = v;
        }
        if let Some(v) = patch.default_expose_port_access {
            self.default_expose_port_access = v;
        }
        if let Some(v) = patch.default_expose_files_access {
            self.default_expose_files_access = v;
        }
        if let Some(v) = patch.blocked_ports {
            self.blocked_ports = v;
        }
        if let Some(v) = patch.allowed_path_roots {
            self.allowed_path_roots = v;
        }
        if let Some(t) = patch.tunnel {
            if let Some(v) = t.edge_ip_version {
                self.tunnel.edge_ip_version = v;
            }
            if let Some(v) = t.protocol {
                self.tunnel.protocol = v;
            }
        }
        if let Some(r) = patch.rate_limit {
            if let Some(v) = r.enabled {
                self.rate_limit.enabled = v;
            }
            if let Some(v) = r.window_ms {
                self.rate_limit.window_ms = v;
            }
            if let Some(v) = r.max_requests {
                self.rate_limit.max_requests = v;
            }
        }
    }
}

/// A partial policy, as read from `policy.json` or the runtime config.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", default)]
pub struct PolicyPatch {
    /// See [`Policy::default_ttl_seconds`].
    pub default_ttl_seconds: Option<u64>,
    /// See [`Policy::max_ttl_seconds`].
    pub max_ttl_seconds: Option<u64>,
    /// See [`Policy::default_expose_port_access`].
    pub default_expose_port_access: Option<AccessMode>,
    /// See [`Policy::default_expose_files_access`].
    pub default_expose_files_access: Option<AccessMode>,
    /// See [`Policy::blocked_ports`].
    pub blocked_ports: Option<BTreeSet<u16>>,
    /// See [`Policy::allowed_path_roots`].
    pub allowed_path_roots: Option<Vec<PathBuf>>,
    /// See [`Policy::tunnel`].
    pub tunnel: Option<TunnelPolicyPatch>,
    /// See [`Policy::rate_limit`].
    pub rate_limit: Option<RateLimitPolicyPatch>,
}

/// Partial tunnel tuning.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelPolicyPatch {
    /// See [`TunnelPolicy::edge_ip_version`].
    pub edge_ip_version: Option<EdgeIpVersion>,
    /// See [`TunnelPolicy::protocol`].
    pub protocol: Option<TunnelProtocol>,
}

/// Partial rate-limit settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitPolicyPatch {
    /// See [`RateLimitPolicy::enabled`].
    pub enabled: Option<bool>,
    /// See [`RateLimitPolicy::window_ms`].
    pub window_ms: Option<u64>,
    /// See [`RateLimitPolicy::max_requests`].
    pub max_requests: Option<u64>,
}

const KNOWN_KEYS: &[&str] = &[
    "default_ttl_seconds",
    "max_ttl_seconds",
    "default_expose_port_access",
    "default_expose_files_access",
    "blocked_ports",
    "allowed_path_roots",
    "tunnel",
    "rate_limit",
];

const TUNNEL_KEYS: &[&str] = &["edge_ip_version", "protocol"];
const RATE_LIMIT_KEYS: &[&str] = &["enabled", "window_ms", "max_requests"];

/// Sanitize a raw JSON patch in place, collecting warnings.
///
/// Unknown keys are dropped with a warning. Enum fields holding invalid
/// values are dropped with a warning so the lower layer's value survives.
/// The returned value deserializes into [`PolicyPatch`] without error.
pub fn sanitize_patch(raw: &mut serde_json::Value, origin: &str, warnings: &mut Vec<String>) {
    let Some(map) = raw.as_object_mut() else {
        warnings.push(format!("{origin}: policy patch is not an object, ignored"));
        *raw = serde_json::json!({});
        return;
    };

    map.retain(|key, _| {
        let known = KNOWN_KEYS.contains(&key.as_str());
        if !known {
            warnings.push(format!("{origin}: unknown policy key '{key}' dropped"));
        }
        known
    });

    for field in ["default_expose_port_access", "default_expose_files_access"] {
        retain_valid_enum(map, field, |s| AccessMode::parse(s).is_some(), origin, warnings);
    }

    if let Some(tunnel) = map.get_mut("tunnel") {
        if let Some(tmap) = tunnel.as_object_mut() {
            tmap.retain(|key, _| {
                let known = TUNNEL_KEYS.contains(&key.as_str());
                if !known {
                    warnings.push(format!("{origin}: unknown policy key 'tunnel.{key}' dropped"));
                }
                known
            });
            retain_valid_enum(tmap, "edge_ip_version", |s| EdgeIpVersion::parse(s).is_some(), origin, warnings);
            retain_valid_enum(tmap, "protocol", |s| TunnelProtocol::parse(s).is_some(), origin, warnings);
        } else {
            warnings.push(format!("{origin}: 'tunnel' is not an object, dropped"));
            map.remove("tunnel");
        }
    }

    if let Some(rate) = map.get_mut("rate_limit") {
        if let Some(rmap) = rate.as_object_mut() {
            rmap.retain(|key, _| {
                let known = RATE_LIMIT_KEYS.contains(&key.as_str());
                if !known {
                    warnings.push(format!(
                        "{origin}: unknown policy key 'rate_limit.{key}' dropped"
                    ));
                }
                known
            });
        } else {
            warnings.push(format!("{origin}: 'rate_limit' is not an object, dropped"));
            map.remove("rate_limit");
        }
    }
}

fn retain_valid_enum(
    map: &mut serde_json::Map<String, serde_json::Value>,
    field: &str,
    valid: impl Fn(&str) -> bool,
    origin: &str,
    warnings: &mut Vec<String>,
) {
    let ok = match map.get(field) {
        None => return,
        // The tunnel edge IP version is conventionally written as a bare
        // number; accept it and rewrite to the string form.
        Some(serde_json::Value::Number(n)) if field == "edge_ip_version" => {
            matches!(n.as_u64(), Some(4) | Some(6))
        }
        Some(serde_json::Value::String(s)) => valid(s),
        Some(_) => false,
    };
    if !ok {
        warnings.push(format!(
            "{origin}: invalid value for '{field}', falling back to default"
        ));
        map.remove(field);
    } else if let Some(serde_json::Value::Number(n)) = map.get(field) {
        let s = n.to_string();
        map.insert(field.to_string(), serde_json::Value::String(s));
    }
}

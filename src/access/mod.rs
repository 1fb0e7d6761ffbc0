//! Access control for exposure origins.
//!
//! Three concerns, each evaluated per request in this order by the origins:
//! rate limiting, path allow-listing, and authorization. Secrets are
//! generated fresh per session and compared in constant time.

mod ratelimit;

pub use ratelimit::RateLimiter;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use hyper::header::{HeaderMap, AUTHORIZATION};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::policy::AccessMode;

/// Username used for basic-auth exposures.
pub const BASIC_USERNAME: &str = "cfshare";

/// Header carrying the bearer token as an alternative to `Authorization`.
pub const TOKEN_HEADER: &str = "x-cfshare-token";

/// Per-session access state: mode, secrets, origin protection and path
/// allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessState {
    /// Authorization mode.
    pub mode: AccessMode,
    /// Bearer token (mode = token); fresh 128-bit hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Basic-auth username (mode = basic).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic-auth password (mode = basic); fresh 96-bit base64url.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Whether the origin enforces authorization at all.
    pub protect_origin: bool,
    /// Exact-segment path prefixes; empty means allow all paths.
    #[serde(default)]
    pub allowlist_paths: Vec<String>,
}

impl AccessState {
    /// Issue a fresh access state for `mode`, generating secrets as needed.
    pub fn issue(mode: AccessMode, protect_origin: bool, allowlist_paths: Vec<String>) -> Self {
        let mut rng = rand::thread_rng();
        let (token, username, password) = match mode {
            AccessMode::Token => {
                let mut bytes = [0u8; 16];
                rng.fill_bytes(&mut bytes);
                (Some(hex::encode(bytes)), None, None)
            }
            AccessMode::Basic => {
                let mut bytes = [0u8; 12];
                rng.fill_bytes(&mut bytes);
                (
                    None,
                    Some(BASIC_USERNAME.to_string()),
                    Some(BASE64_URL.encode(bytes)),
                )
            }
            AccessMode::None => (None, None, None),
        };
        Self {
            mode,
            token,
            username,
            password,
            protect_origin,
            allowlist_paths,
        }
    }

    /// Mask a secret for display: first three and last two characters with
    /// `***` between, or `***` outright for short secrets.
    pub fn mask(secret: &str) -> String {
        if secret.len() <= 6 {
            return "***".to_string();
        }
        format!("{}***{}", &secret[..3], &secret[secret.len() - 2..])
    }
}

/// Outcome of the per-request authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Request may proceed.
    Allowed,
    /// Request is rejected with 401.
    Unauthorized,
}

/// Evaluate authorization for a request given its query string and headers.
///
/// `mode = none` and unprotected origins always pass. Token mode accepts the
/// `?token=` query parameter, the `X-Cfshare-Token` header, or a bearer
/// `Authorization` header. Basic mode requires a matching username and
/// password. All secret comparisons are constant-time.
pub fn authorize(access: &AccessState, query: Option<&str>, headers: &HeaderMap) -> AuthOutcome {
    if !access.protect_origin || access.mode == AccessMode::None {
        return AuthOutcome::Allowed;
    }

    match access.mode {
        AccessMode::Token => {
            let Some(expected) = access.token.as_deref() else {
                return AuthOutcome::Unauthorized;
            };
            let presented = token_from_query(query)
                .or_else(|| token_from_header(headers))
                .or_else(|| bearer_from_authorization(headers));
            match presented {
                Some(candidate) if ct_eq(candidate.as_bytes(), expected.as_bytes()) => {
                    AuthOutcome::Allowed
                }
                _ => AuthOutcome::Unauthorized,
            }
        }
        AccessMode::Basic => {
            let (Some(user), Some(pass)) = (access.username.as_deref(), access.password.as_deref())
            else {
                return AuthOutcome::Unauthorized;
            };
            match basic_from_authorization(headers) {
                Some((u, p))
                    if ct_eq(u.as_bytes(), user.as_bytes())
                        & ct_eq(p.as_bytes(), pass.as_bytes()) =>
                {
                    AuthOutcome::Allowed
                }
                _ => AuthOutcome::Unauthorized,
            }
        }
        AccessMode::None => AuthOutcome::Allowed,
    }
}

/// Exact-segment allow-list check.
///
/// An empty list allows everything. Otherwise the request path must equal a
/// prefix or start with the prefix followed by `/`.
pub fn path_allowed(allowlist: &[String], path: &str) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        path == prefix || path.starts_with(&format!("{prefix}/"))
    })
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "token" {
                return urlencoding::decode(value).ok().map(|v| v.into_owned());
            }
        }
    }
    None
}

fn token_from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

fn bearer_from_authorization(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let rest = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    Some(rest.trim().to_string())
}

fn basic_from_authorization(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let rest = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(rest.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

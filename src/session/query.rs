//! Query surface: list, get, logs, and the public-URL probe.
//!
//! `get` accepts three input shapes (`{id}`, `{ids}`, `{filter}`), expands
//! the `all` sentinel, applies optional field projection, and paginates
//! manifests with hard per-item caps.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ExposeError;
use super::manager::{ExposureManager, SessionHandle};
use super::record::{LogComponent, LogEntry};
use crate::access::AccessState;
use crate::policy::AccessMode;

/// Hard cap on sessions returned by one `get`.
const MAX_SELECTION: usize = 200;

/// Manifest items included when a single session is selected.
const MANIFEST_CAP_SINGLE: usize = 200;

/// Manifest items included per session when several are selected.
const MANIFEST_CAP_MULTI: usize = 20;

/// Timeout for the public-URL probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Status/type filter for `get`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GetFilter {
    /// Match this status only.
    pub status: Option<String>,
    /// Match this exposure type only.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// Parameters for `get`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GetParams {
    /// A single id, or `all`.
    pub id: Option<String>,
    /// A list of ids; may contain `all`.
    pub ids: Option<Vec<String>>,
    /// A status/type filter over all sessions.
    pub filter: Option<GetFilter>,
    /// Project each result down to these top-level fields.
    pub fields: Option<Vec<String>>,
    /// Probe `public_url` with an authenticated HEAD request.
    pub probe_public: Option<bool>,
}

/// Parameters for `logs`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct LogsParams {
    /// A single id, or `all`.
    pub id: Option<String>,
    /// A list of ids.
    pub ids: Option<Vec<String>>,
    /// `tunnel`, `origin`, `manager`, or `all` (default).
    pub component: Option<String>,
    /// Only lines newer than this many seconds.
    pub since_seconds: Option<u64>,
    /// Last N lines per session; clamped to [1, 1000], default 200.
    pub limit: Option<usize>,
}

impl ExposureManager {
    /// Summaries of every live session.
    pub fn list(&self) -> Value {
        let sessions: Vec<Value> = self
            .all_sessions()
            .iter()
            .map(|handle| summary_view(handle))
            .collect();
        json!({"sessions": sessions, "count": sessions.len()})
    }

    /// Detailed session lookup; see [`GetParams`] for the accepted shapes.
    pub async fn get(&self, params: GetParams) -> Result<Value, ExposeError> {
        let mut missing: Vec<String> = Vec::new();
        let selected: Vec<Arc<SessionHandle>> = match (&params.id, &params.ids, &params.filter) {
            (Some(id), None, None) if id != "all" => {
                vec![self
                    .session(id)
                    .ok_or_else(|| ExposeError::NotFound(id.clone()))?]
            }
            (Some(_), None, None) => self.all_sessions(),
            (None, Some(ids), None) => {
                if ids.iter().any(|id| id == "all") {
                    self.all_sessions()
                } else {
                    let mut handles = Vec::new();
                    for id in ids {
                        match self.session(id) {
                            Some(handle) => handles.push(handle),
                            None => missing.push(id.clone()),
                        }
                    }
                    handles
                }
            }
            (None, None, filter) => {
                let filter = filter.clone().unwrap_or_default();
                self.all_sessions()
                    .into_iter()
                    .filter(|handle| {
                        let record = handle.record_snapshot();
                        filter
                            .status
                            .as_deref()
                            .map_or(true, |s| record.status.as_str() == s)
                            && filter
                                .kind
                                .as_deref()
                                .map_or(true, |k| record.kind.as_str() == k)
                    })
                    .collect()
            }
            _ => {
                return Err(ExposeError::InvalidInput(
                    "provide exactly one of 'id', 'ids', or 'filter'".into(),
                ));
            }
        };

        let truncated = selected.len() > MAX_SELECTION;
        let selected = &selected[..selected.len().min(MAX_SELECTION)];
        let manifest_cap = if selected.len() == 1 {
            MANIFEST_CAP_SINGLE
        } else {
            MANIFEST_CAP_MULTI
        };

        let probe = params.probe_public.unwrap_or(false);
        let mut sessions = Vec::with_capacity(selected.len());
        for handle in selected {
            let mut view = session_view(handle, manifest_cap);
            if probe {
                view["probe"] = probe_public(handle).await;
            }
            if let Some(fields) = &params.fields {
                view = project_fields(view, fields);
            }
            sessions.push(view);
        }

        let mut result = json!({
            "sessions": sessions,
            "truncated": truncated,
        });
        if !missing.is_empty() {
            result["missing"] = json!(missing
                .iter()
                .map(|id| json!({"id": id, "error": "not_found"}))
                .collect::<Vec<_>>());
        }
        Ok(result)
    }

    /// Per-session log tails; see [`LogsParams`].
    pub fn logs(&self, params: LogsParams) -> Result<Value, ExposeError> {
        let limit = params.limit.unwrap_or(200).clamp(1, 1_000);
        let component = match params.component.as_deref() {
            None | Some("all") => None,
            Some("tunnel") => Some(LogComponent::Tunnel),
            Some("origin") => Some(LogComponent::Origin),
            Some("manager") => Some(LogComponent::Manager),
            Some(other) => {
                return Err(ExposeError::InvalidInput(format!(
                    "unknown component: {other}"
                )));
            }
        };

        let cutoff = params.since_seconds.map(|secs| {
            self.inner.clock.now().fixed_offset() - chrono::Duration::seconds(secs as i64)
        });

        let mut targets: Vec<(String, Option<Arc<SessionHandle>>)> = Vec::new();
        match (&params.id, &params.ids) {
            (Some(id), None) if id == "all" => {
                for handle in self.all_sessions() {
                    targets.push((handle.shared.id.clone(), Some(handle)));
                }
            }
            (Some(id), None) => targets.push((id.clone(), self.session(id))),
            (None, Some(ids)) => {
                if ids.iter().any(|id| id == "all") {
                    for handle in self.all_sessions() {
                        targets.push((handle.shared.id.clone(), Some(handle)));
                    }
                } else {
                    for id in ids {
                        targets.push((id.clone(), self.session(id)));
                    }
                }
            }
            (None, None) => {
                for handle in self.all_sessions() {
                    targets.push((handle.shared.id.clone(), Some(handle)));
                }
            }
            (Some(_), Some(_)) => {
                return Err(ExposeError::InvalidInput(
                    "provide either 'id' or 'ids', not both".into(),
                ));
            }
        }

        let sessions: Vec<Value> = targets
            .into_iter()
            .map(|(id, handle)| match handle {
                None => json!({"id": id, "error": "not_found"}),
                Some(handle) => {
                    let mut lines: Vec<LogEntry> = handle
                        .shared
                        .logs
                        .snapshot()
                        .into_iter()
                        .filter(|entry| component.map_or(true, |c| entry.component == c))
                        .filter(|entry| match cutoff {
                            None => true,
                            Some(cutoff) => DateTime::parse_from_rfc3339(&entry.ts)
                                .map(|ts| ts >= cutoff)
                                .unwrap_or(true),
                        })
                        .collect();
                    if lines.len() > limit {
                        lines.drain(..lines.len() - limit);
                    }
                    json!({"id": id, "lines": lines})
                }
            })
            .collect();

        Ok(json!({"sessions": sessions}))
    }
}

/// Compact view used by `list`.
fn summary_view(handle: &Arc<SessionHandle>) -> Value {
    let record = handle.record_snapshot();
    let stats = handle.shared.stats_snapshot();
    json!({
        "id": record.id,
        "type": record.kind.as_str(),
        "status": record.status.as_str(),
        "public_url": record.public_url,
        "expires_at": record.expires_at,
        "access": access_info(&handle.shared.access),
        "stats": stats,
    })
}

/// Full view used by `get`, with the manifest capped.
pub(crate) fn session_view(handle: &Arc<SessionHandle>, manifest_cap: usize) -> Value {
    let record = handle.record_snapshot();
    let stats = handle.shared.stats_snapshot();
    let manifest_total = record.manifest.len();
    let manifest: Vec<_> = record.manifest.iter().take(manifest_cap).collect();

    json!({
        "id": record.id,
        "type": record.kind.as_str(),
        "status": record.status.as_str(),
        "created_at": record.created_at,
        "expires_at": record.expires_at,
        "ttl_seconds": record.ttl_seconds,
        "source_port": record.source_port,
        "origin_port": record.origin_port,
        "local_url": record.local_url,
        "public_url": record.public_url,
        "workspace_dir": record.workspace_dir,
        "presentation": record.presentation,
        "mode": record.mode,
        "max_downloads": record.max_downloads,
        "last_error": record.last_error,
        "access_info": access_info(&handle.shared.access),
        "stats": stats,
        "manifest": manifest,
        "manifest_total": manifest_total,
        "manifest_truncated": manifest_total > manifest_cap,
    })
}

/// Expose-result view: the session view plus the credentials block, which
/// is the only place full secrets ever appear.
pub(crate) fn expose_result(handle: &Arc<SessionHandle>) -> Value {
    let mut view = session_view(handle, MANIFEST_CAP_SINGLE);
    view["credentials"] = credentials(handle);
    view
}

/// Masked access summary; never contains raw secrets.
fn access_info(access: &AccessState) -> Value {
    let mut info = json!({
        "mode": access.mode,
        "protect_origin": access.protect_origin,
    });
    if let Some(token) = &access.token {
        info["token"] = json!(AccessState::mask(token));
    }
    if let Some(username) = &access.username {
        info["username"] = json!(username);
    }
    if let Some(password) = &access.password {
        info["password"] = json!(AccessState::mask(password));
    }
    if !access.allowlist_paths.is_empty() {
        info["allowlist_paths"] = json!(access.allowlist_paths);
    }
    info
}

fn credentials(handle: &Arc<SessionHandle>) -> Value {
    let access = &handle.shared.access;
    let record = handle.record_snapshot();
    let mut creds = json!({});
    if let Some(token) = &access.token {
        creds["token"] = json!(token);
        if let Some(url) = &record.public_url {
            creds["authenticated_url"] = json!(format!("{url}/?token={token}"));
        }
    }
    if let (Some(username), Some(password)) = (&access.username, &access.password) {
        creds["username"] = json!(username);
        creds["password"] = json!(password);
    }
    creds
}

/// Keep only the requested top-level fields (plus `id`).
fn project_fields(view: Value, fields: &[String]) -> Value {
    let Value::Object(map) = view else {
        return view;
    };
    let mut projected = serde_json::Map::new();
    for (key, value) in map {
        if key == "id" || fields.iter().any(|f| f == &key) {
            projected.insert(key, value);
        }
    }
    Value::Object(projected)
}

/// HEAD-probe the public URL with the session's credentials; bounded by a
/// 3 s timeout and never blocks the call past it.
async fn probe_public(handle: &Arc<SessionHandle>) -> Value {
    let record = handle.record_snapshot();
    let Some(url) = record.public_url else {
        return json!({"ok": false, "error": "no_public_url"});
    };

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => return json!({"ok": false, "error": e.to_string()}),
    };

    let access = &handle.shared.access;
    let mut request = client.head(&url);
    match access.mode {
        AccessMode::Token => {
            if let Some(token) = &access.token {
                request = request.header(crate::access::TOKEN_HEADER, token);
            }
        }
        AccessMode::Basic => {
            if let (Some(username), Some(password)) = (&access.username, &access.password) {
                request = request.basic_auth(username, Some(password));
            }
        }
        AccessMode::None => {}
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            json!({"ok": response.status().is_success(), "status": status})
        }
        Err(e) => json!({"ok": false, "error": e.to_string()}),
    }
}

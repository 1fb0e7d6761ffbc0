//! The exposure manager: session table, state machine, and bring-up flows.
//!
//! One [`ExposureManager`] per process. It owns the live session table and
//! every session's OS resources: the tunnel child, the origin servers, the
//! TTL timer, and the workspace directory. The three concurrent
//! termination sources (TTL/reaper, child exit, client stop) plus the
//! download quota all funnel into [`ManagerInner::terminate_session`],
//! which runs the terminal transition exactly once per session under the
//! session's resource lock.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat};
use serde::Deserialize;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::error::ExposeError;
use super::record::{
    new_session_id, ExposeKind, LogComponent, LogRing, Presentation, SessionRecord, SessionShared,
    SessionStats, SessionStatus, ShareMode, StopReason, StopRequest,
};
use crate::access::{AccessState, RateLimiter};
use crate::audit::{AuditEvent, AuditFilter, AuditKind, AuditStore, SnapshotEntry};
use crate::netutil::probe_local_port;
use crate::origin::files::FilesOrigin;
use crate::origin::proxy::ReverseProxyOrigin;
use crate::origin::{spawn_origin, OriginHandle};
use crate::policy::{AccessMode, LoadedPolicy, PolicyLoader};
use crate::runtime::RuntimeConfig;
use crate::tunnel::{resolve_agent, start_tunnel, terminate, TunnelError, TunnelSettings};
use crate::workspace::manifest::{build_manifest, write_zip_bundle};
use crate::workspace::{build_workspace, WorkspaceError};

/// Options shared by both expose operations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ExposeOpts {
    /// Requested TTL; clamped into policy bounds.
    pub ttl_seconds: Option<u64>,
    /// Access mode; policy default when absent.
    pub access: Option<AccessMode>,
    /// Explicit origin protection; defaults to `access != none`.
    pub protect_origin: Option<bool>,
    /// Exact-segment path allow-list.
    pub allowlist_paths: Option<Vec<String>>,
    /// Stop the session once this many downloads completed.
    pub max_downloads: Option<u64>,
    /// File presentation (files only).
    pub presentation: Option<Presentation>,
    /// Share mode (files only).
    pub mode: Option<ShareMode>,
}

/// Parameters for `expose_port`.
#[derive(Debug, Deserialize)]
pub struct ExposePortParams {
    /// The local TCP port; non-integer values are truncated.
    pub port: f64,
    /// Options.
    #[serde(default)]
    pub opts: Option<ExposeOpts>,
}

/// Parameters for `expose_files`.
#[derive(Debug, Deserialize)]
pub struct ExposeFilesParams {
    /// Files and directories to copy and serve.
    pub paths: Vec<PathBuf>,
    /// Options.
    #[serde(default)]
    pub opts: Option<ExposeOpts>,
}

/// Parameters for `stop`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct StopParams {
    /// A single id, or the sentinel `all`.
    pub id: Option<String>,
    /// A list of ids; may contain the sentinel `all`.
    pub ids: Option<Vec<String>>,
}

/// OS resources owned by one session; released exactly once.
#[derive(Default)]
pub(crate) struct SessionResources {
    pub(crate) terminal: bool,
    pub(crate) child: Option<Arc<TokioMutex<Option<Child>>>>,
    pub(crate) origin: Option<OriginHandle>,
    pub(crate) proxy: Option<OriginHandle>,
    pub(crate) ttl_task: Option<JoinHandle<()>>,
    pub(crate) watcher_task: Option<JoinHandle<()>>,
    pub(crate) workspace_dir: Option<PathBuf>,
}

/// One live session.
pub struct SessionHandle {
    /// State shared with origins and stream pumps.
    pub shared: Arc<SessionShared>,
    pub(crate) record: StdMutex<SessionRecord>,
    pub(crate) resources: TokioMutex<SessionResources>,
}

impl SessionHandle {
    /// Copy out the record.
    pub fn record_snapshot(&self) -> SessionRecord {
        self.record.lock().expect("record lock poisoned").clone()
    }

    fn update_record(&self, f: impl FnOnce(&mut SessionRecord)) {
        let mut record = self.record.lock().expect("record lock poisoned");
        f(&mut record);
    }
}

pub(crate) struct ManagerInner {
    pub(crate) runtime: RuntimeConfig,
    pub(crate) policy: RwLock<Arc<LoadedPolicy>>,
    pub(crate) sessions: StdMutex<HashMap<String, Arc<SessionHandle>>>,
    pub(crate) audit: AuditStore,
    pub(crate) clock: Arc<dyn Clock>,
    stop_tx: mpsc::UnboundedSender<StopRequest>,
}

/// The process-wide exposure manager.
pub struct ExposureManager {
    pub(crate) inner: Arc<ManagerInner>,
}

fn iso(dt: DateTime<Local>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn map_tunnel_error(e: TunnelError) -> ExposeError {
    match e {
        TunnelError::AgentNotFound(msg) => ExposeError::AgentNotFound(msg),
        other => ExposeError::TunnelStartup(other.to_string()),
    }
}

fn map_workspace_error(e: WorkspaceError) -> ExposeError {
    match e {
        WorkspaceError::Ignored(path) => {
            ExposeError::PolicyViolation(format!("path blocked by ignore rules: {}", path.display()))
        }
        WorkspaceError::OutsideAllowedRoots(path) => {
            ExposeError::PolicyViolation(format!("path outside allowed roots: {}", path.display()))
        }
        WorkspaceError::NotFound(path) => {
            ExposeError::InvalidInput(format!("input not found: {}", path.display()))
        }
        WorkspaceError::UnsupportedType(path) => {
            ExposeError::InvalidInput(format!("unsupported input type: {}", path.display()))
        }
        WorkspaceError::Copy { path, source } => {
            ExposeError::Internal(format!("copy failed for {}: {source}", path.display()))
        }
    }
}

impl ExposureManager {
    /// Create a manager with the system clock. Must be called inside a
    /// tokio runtime; the reaper and stop-queue tasks start immediately.
    pub fn new(runtime: RuntimeConfig) -> Result<Self, ExposeError> {
        Self::with_clock(runtime, Arc::new(SystemClock))
    }

    /// Create a manager with an injected clock.
    pub fn with_clock(runtime: RuntimeConfig, clock: Arc<dyn Clock>) -> Result<Self, ExposeError> {
        fs::create_dir_all(&runtime.state_dir)
            .map_err(|e| ExposeError::Internal(format!("cannot create state dir: {e}")))?;
        fs::create_dir_all(runtime.workspaces_dir())
            .map_err(|e| ExposeError::Internal(format!("cannot create workspaces dir: {e}")))?;

        let loaded = PolicyLoader::new(&runtime.state_dir, runtime.policy_patch.clone())
            .load()
            .map_err(|e| ExposeError::Internal(format!("policy load failed: {e}")))?;
        let audit = AuditStore::new(&runtime.state_dir);

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            runtime,
            policy: RwLock::new(Arc::new(loaded)),
            sessions: StdMutex::new(HashMap::new()),
            audit,
            clock,
            stop_tx,
        });

        spawn_stop_loop(&inner, stop_rx);
        spawn_reaper(&inner);

        Ok(Self { inner })
    }

    /// Expose a local TCP service.
    pub async fn expose_port(
        &self,
        params: ExposePortParams,
    ) -> Result<serde_json::Value, ExposeError> {
        let inner = &self.inner;
        let loaded = inner.policy_snapshot();

        if !params.port.is_finite() {
            return Err(ExposeError::InvalidInput(format!(
                "port is not a number: {}",
                params.port
            )));
        }
        let port = params.port.trunc();
        if !(1.0..=65_535.0).contains(&port) {
            return Err(ExposeError::InvalidInput(format!(
                "port out of range: {}",
                params.port
            )));
        }
        let port = port as u16;
        if loaded.policy.blocked_ports.contains(&port) {
            return Err(ExposeError::PolicyViolation(format!(
                "port blocked by policy: {port}"
            )));
        }
        if !probe_local_port(port).await {
            return Err(ExposeError::LocalUnreachable(port));
        }

        let opts = params.opts.unwrap_or_default();
        let ttl = loaded.policy.clamp_ttl(opts.ttl_seconds);
        let mode = opts.access.unwrap_or_else(|| loaded.policy.default_access(false));
        let protect = opts.protect_origin.unwrap_or(mode != AccessMode::None);
        let allowlist = opts.allowlist_paths.clone().unwrap_or_default();
        let needs_proxy = protect || !allowlist.is_empty() || loaded.policy.rate_limit.enabled;

        let agent_path =
            resolve_agent(inner.runtime.agent_path.as_deref()).map_err(map_tunnel_error)?;

        let handle = inner.allocate_session(
            ExposeKind::Port,
            ttl,
            AccessState::issue(mode, protect, allowlist),
            RateLimiter::from_policy(&loaded.policy.rate_limit),
            opts.max_downloads,
            |record| {
                record.source_port = Some(port);
            },
        );
        let id = handle.shared.id.clone();
        info!("exposing port {port} as session {id}");

        let bring_up = async {
            let tunnel_target = if needs_proxy {
                let proxy = spawn_origin(Arc::new(ReverseProxyOrigin::new(
                    port,
                    handle.shared.clone(),
                )))
                .await
                .map_err(|e| ExposeError::Internal(format!("proxy start failed: {e}")))?;
                let proxy_port = proxy.port;
                handle.resources.lock().await.proxy = Some(proxy);
                proxy_port
            } else {
                port
            };
            inner
                .finish_bring_up(&handle, tunnel_target, agent_path, ttl)
                .await
        };

        match bring_up.await {
            Ok(()) => {
                inner.record_started(&handle, serde_json::json!({"port": port}));
                Ok(super::query::expose_result(&handle))
            }
            Err(e) => {
                inner.abort_bring_up(&id).await;
                Err(e)
            }
        }
    }

    /// Expose a set of files and directories.
    pub async fn expose_files(
        &self,
        params: ExposeFilesParams,
    ) -> Result<serde_json::Value, ExposeError> {
        let inner = &self.inner;
        let loaded = inner.policy_snapshot();

        if params.paths.is_empty() {
            return Err(ExposeError::InvalidInput("paths must not be empty".into()));
        }

        let opts = params.opts.unwrap_or_default();
        let ttl = loaded.policy.clamp_ttl(opts.ttl_seconds);
        let mode = opts.access.unwrap_or_else(|| loaded.policy.default_access(true));
        let protect = opts.protect_origin.unwrap_or(mode != AccessMode::None);
        let allowlist = opts.allowlist_paths.clone().unwrap_or_default();
        let presentation = opts.presentation.unwrap_or_default();
        let share_mode = opts.mode.unwrap_or_default();

        let agent_path =
            resolve_agent(inner.runtime.agent_path.as_deref()).map_err(map_tunnel_error)?;

        let handle = inner.allocate_session(
            ExposeKind::Files,
            ttl,
            AccessState::issue(mode, protect, allowlist),
            RateLimiter::from_policy(&loaded.policy.rate_limit),
            opts.max_downloads,
            |record| {
                record.presentation = presentation;
                record.mode = share_mode;
            },
        );
        let id = handle.shared.id.clone();
        info!("exposing {} path(s) as session {id}", params.paths.len());

        let bring_up = async {
            let workspace_dir = inner.runtime.workspaces_dir().join(&id);
            fs::create_dir_all(&workspace_dir)
                .map_err(|e| ExposeError::Internal(format!("workspace create failed: {e}")))?;
            restrict_permissions(&workspace_dir);
            {
                let mut resources = handle.resources.lock().await;
                resources.workspace_dir = Some(workspace_dir.clone());
            }
            handle.update_record(|record| record.workspace_dir = Some(workspace_dir.clone()));

            let copied =
                build_workspace(&params.paths, &workspace_dir, &loaded.policy, &loaded.matcher)
                    .map_err(map_workspace_error)?;
            let inputs: Vec<serde_json::Value> = copied
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "source": c.source,
                        "name": c.name,
                        "directory": c.is_dir,
                    })
                })
                .collect();

            let files = build_manifest(&workspace_dir)
                .map_err(|e| ExposeError::Internal(format!("manifest build failed: {e}")))?;
            let bundle = if share_mode == ShareMode::Zip {
                Some(
                    write_zip_bundle(&workspace_dir, &files)
                        .map_err(|e| ExposeError::Internal(format!("zip bundling failed: {e}")))?,
                )
            } else {
                None
            };

            let origin_svc = FilesOrigin::new(
                workspace_dir.clone(),
                files,
                bundle,
                share_mode,
                presentation,
                handle.shared.clone(),
            );
            let public_manifest = origin_svc.public_manifest();
            let origin = spawn_origin(Arc::new(origin_svc))
                .await
                .map_err(|e| ExposeError::Internal(format!("origin start failed: {e}")))?;
            let origin_port = origin.port;
            handle.resources.lock().await.origin = Some(origin);
            handle.update_record(|record| {
                record.manifest = public_manifest;
                record.local_url = Some(format!("http://127.0.0.1:{origin_port}"));
            });

            inner
                .finish_bring_up(&handle, origin_port, agent_path, ttl)
                .await?;
            Ok::<_, ExposeError>(inputs)
        };

        match bring_up.await {
            Ok(inputs) => {
                inner.record_started(&handle, serde_json::json!({"inputs": inputs.len()}));
                let mut result = super::query::expose_result(&handle);
                result["inputs"] = serde_json::Value::Array(inputs);
                Ok(result)
            }
            Err(e) => {
                inner.abort_bring_up(&id).await;
                Err(e)
            }
        }
    }

    /// Stop one session, several, or all.
    pub async fn stop(&self, params: StopParams) -> Result<serde_json::Value, ExposeError> {
        let requested: Vec<String> = match (params.id, params.ids) {
            (Some(_), Some(_)) => {
                return Err(ExposeError::InvalidInput(
                    "provide either 'id' or 'ids', not both".into(),
                ));
            }
            (Some(id), None) => vec![id],
            (None, Some(ids)) => ids,
            (None, None) => {
                return Err(ExposeError::InvalidInput("'id' or 'ids' is required".into()));
            }
        };

        let ids: Vec<String> = if requested.iter().any(|id| id == "all") {
            self.inner.live_ids()
        } else {
            let mut seen = HashSet::new();
            requested
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };

        let mut stopped = Vec::new();
        let mut failed = Vec::new();
        let mut cleaned = Vec::new();
        for id in ids {
            match self.inner.terminate_session(&id, StopReason::User).await {
                Ok(workspace) => {
                    stopped.push(id);
                    if let Some(path) = workspace {
                        cleaned.push(path);
                    }
                }
                Err(_) => {
                    failed.push(serde_json::json!({"id": id, "error": "not_found"}));
                }
            }
        }

        Ok(serde_json::json!({
            "stopped": stopped,
            "failed": failed,
            "cleaned": cleaned,
        }))
    }

    /// Run one reaper pass: retire every running session past its expiry.
    pub async fn reap_expired(&self) -> usize {
        self.inner.reap_expired().await
    }

    /// Environment diagnostics: agent resolution, state dir, live sessions.
    pub fn env_check(&self) -> serde_json::Value {
        let inner = &self.inner;
        let agent = match resolve_agent(inner.runtime.agent_path.as_deref()) {
            Ok(path) => {
                let version = crate::tunnel::agent_version(&path);
                serde_json::json!({"found": true, "path": path, "version": version})
            }
            Err(e) => serde_json::json!({"found": false, "error": e.to_string()}),
        };

        let probe = inner.runtime.state_dir.join(".envcheck");
        let writable = fs::write(&probe, b"ok").is_ok();
        let _ = fs::remove_file(&probe);

        let loaded = inner.policy_snapshot();
        serde_json::json!({
            "agent": agent,
            "state_dir": {"path": inner.runtime.state_dir, "writable": writable},
            "sessions": inner.live_ids().len(),
            "policy_warnings": loaded.warnings,
        })
    }

    /// Remove orphan workspaces and signal stale agent PIDs from the last
    /// snapshot.
    pub async fn run_gc(&self) -> serde_json::Value {
        let inner = &self.inner;
        let live: HashSet<String> = inner.live_ids().into_iter().collect();

        let removed =
            crate::audit::sweep_orphan_workspaces(&inner.runtime.workspaces_dir(), &live);

        let mut signaled = 0u32;
        for entry in inner.audit.read_snapshot() {
            if live.contains(&entry.id) {
                continue;
            }
            if let Some(pid) = entry.process_pid {
                if crate::audit::terminate_stale_pid(pid) {
                    signaled += 1;
                }
            }
        }

        inner.audit.append(
            &AuditEvent::new(inner.clock.now_iso(), AuditKind::GcRun).with_details(
                serde_json::json!({
                    "removed_workspaces": removed.len(),
                    "stale_pids_signaled": signaled,
                }),
            ),
        );
        inner.persist_snapshot();

        serde_json::json!({
            "removed_workspaces": removed,
            "stale_pids_signaled": signaled,
        })
    }

    /// The effective policy and any merge warnings.
    pub fn policy_show(&self) -> serde_json::Value {
        let loaded = self.inner.policy_snapshot();
        serde_json::json!({
            "policy": loaded.policy,
            "warnings": loaded.warnings,
        })
    }

    /// Merge a patch into the on-disk policy and swap the effective policy.
    pub fn policy_update(&self, patch: serde_json::Value) -> Result<serde_json::Value, ExposeError> {
        let inner = &self.inner;
        let loader = PolicyLoader::new(&inner.runtime.state_dir, inner.runtime.policy_patch.clone());
        loader
            .write_merged(&patch)
            .map_err(|e| ExposeError::InvalidInput(format!("policy update rejected: {e}")))?;
        let reloaded = loader
            .load()
            .map_err(|e| ExposeError::Internal(format!("policy reload failed: {e}")))?;

        let view = serde_json::json!({
            "policy": reloaded.policy,
            "warnings": reloaded.warnings,
        });
        *inner.policy.write().expect("policy lock poisoned") = Arc::new(reloaded);

        inner.audit.append(
            &AuditEvent::new(inner.clock.now_iso(), AuditKind::PolicyUpdated)
                .with_details(serde_json::json!({"patch": patch})),
        );
        Ok(view)
    }

    /// Query the audit trail.
    pub fn audit_query(&self, filter: AuditFilter) -> serde_json::Value {
        let events = self.inner.audit.query(&filter);
        let count = events.len();
        serde_json::json!({
            "events": events,
            "count": count,
        })
    }

    /// Export the audit trail as JSONL.
    pub fn audit_export(
        &self,
        filter: AuditFilter,
        output_path: Option<PathBuf>,
    ) -> Result<serde_json::Value, ExposeError> {
        let inner = &self.inner;
        let (path, count) = inner
            .audit
            .export(&filter, output_path, inner.clock.now_iso(), inner.clock.now_ms())
            .map_err(|e| ExposeError::Internal(format!("audit export failed: {e}")))?;
        Ok(serde_json::json!({"output_path": path, "events": count}))
    }

    /// Fetch a session handle.
    pub fn session(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot all session handles.
    pub fn all_sessions(&self) -> Vec<Arc<SessionHandle>> {
        let mut handles: Vec<Arc<SessionHandle>> = self
            .inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .values()
            .cloned()
            .collect();
        handles.sort_by_key(|h| h.record_snapshot().created_at.clone());
        handles
    }

    /// True while any session is live.
    pub fn has_live_sessions(&self) -> bool {
        !self.inner.live_ids().is_empty()
    }
}

impl ManagerInner {
    pub(crate) fn policy_snapshot(&self) -> Arc<LoadedPolicy> {
        self.policy.read().expect("policy lock poisoned").clone()
    }

    pub(crate) fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Insert a fresh `starting` session into the table.
    fn allocate_session(
        self: &Arc<Self>,
        kind: ExposeKind,
        ttl: u64,
        access: AccessState,
        limiter: RateLimiter,
        max_downloads: Option<u64>,
        customize: impl FnOnce(&mut SessionRecord),
    ) -> Arc<SessionHandle> {
        let now = self.clock.now();
        let id = new_session_id(kind.as_str(), self.clock.now_ms());

        let shared = Arc::new(SessionShared {
            id: id.clone(),
            kind,
            access,
            limiter,
            max_downloads,
            stats: StdMutex::new(SessionStats::default()),
            logs: LogRing::new(),
            stop_tx: self.stop_tx.clone(),
        });

        let mut record = SessionRecord {
            id: id.clone(),
            kind,
            status: SessionStatus::Starting,
            created_at: iso(now),
            expires_at: iso(now + chrono::Duration::seconds(ttl as i64)),
            ttl_seconds: ttl,
            source_port: None,
            origin_port: None,
            local_url: None,
            public_url: None,
            workspace_dir: None,
            presentation: Presentation::default(),
            mode: ShareMode::default(),
            manifest: Vec::new(),
            max_downloads,
            last_error: None,
            process_pid: None,
        };
        customize(&mut record);

        let handle = Arc::new(SessionHandle {
            shared,
            record: StdMutex::new(record),
            resources: TokioMutex::new(SessionResources::default()),
        });
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(id, handle.clone());
        handle
    }

    /// Start the tunnel against `tunnel_target`, then promote to running
    /// and arm the child watcher and TTL timer.
    async fn finish_bring_up(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        tunnel_target: u16,
        agent_path: PathBuf,
        ttl: u64,
    ) -> Result<(), ExposeError> {
        let loaded = self.policy_snapshot();
        let mut settings = TunnelSettings::new(
            agent_path,
            loaded.policy.tunnel.edge_ip_version,
            loaded.policy.tunnel.protocol,
        );
        settings.attempts = self.runtime.tunnel_attempts;
        settings.ready_timeout = self.runtime.ready_timeout;

        let tunnel = start_tunnel(&settings, tunnel_target, handle.shared.clone())
            .await
            .map_err(map_tunnel_error)?;

        let id = handle.shared.id.clone();
        let watcher = spawn_child_watcher(self, id.clone(), tunnel.child.clone());
        let ttl_task = spawn_ttl_timer(self.stop_tx.clone(), id, ttl);

        {
            let mut resources = handle.resources.lock().await;
            resources.child = Some(tunnel.child.clone());
            resources.watcher_task = Some(watcher);
            resources.ttl_task = Some(ttl_task);
        }
        handle.update_record(|record| {
            record.origin_port = Some(tunnel_target);
            record.public_url = Some(tunnel.public_url.clone());
            record.process_pid = Some(tunnel.pid);
            record.status = SessionStatus::Running;
        });
        handle.shared.log(
            self.clock.now_iso(),
            LogComponent::Manager,
            format!("running at {}", tunnel.public_url),
        );
        Ok(())
    }

    fn record_started(&self, handle: &Arc<SessionHandle>, details: serde_json::Value) {
        let record = handle.record_snapshot();
        self.audit.append(
            &AuditEvent::new(self.clock.now_iso(), AuditKind::ExposureStarted)
                .for_session(&record.id, record.kind.as_str())
                .with_details(details),
        );
        self.persist_snapshot();
    }

    /// Tear down a session that failed during bring-up. No audit events
    /// are written; the exposure never started.
    async fn abort_bring_up(self: &Arc<Self>, id: &str) {
        let handle = {
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions.remove(id)
        };
        let Some(handle) = handle else { return };

        let mut resources = handle.resources.lock().await;
        resources.terminal = true;
        release_resources(&mut resources).await;
        debug!("session {id} torn down after bring-up failure");
    }

    /// The single guarded terminal transition. The first cause wins;
    /// later callers observe `not_found`.
    pub(crate) async fn terminate_session(
        self: &Arc<Self>,
        id: &str,
        reason: StopReason,
    ) -> Result<Option<PathBuf>, ExposeError> {
        let handle = {
            let sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions.get(id).cloned()
        };
        let Some(handle) = handle else {
            return Err(ExposeError::NotFound(id.to_string()));
        };

        let mut resources = handle.resources.lock().await;
        if resources.terminal {
            return Err(ExposeError::NotFound(id.to_string()));
        }
        resources.terminal = true;

        let workspace = resources.workspace_dir.clone();
        release_resources(&mut resources).await;
        drop(resources);

        let status = reason.terminal_status();
        handle.update_record(|record| {
            record.status = status;
            record.process_pid = None;
            if let StopReason::AgentExit(msg) = &reason {
                record.last_error = Some(msg.clone());
            }
        });

        let record = handle.record_snapshot();
        let audit_kind = match reason {
            StopReason::Expired => AuditKind::ExposureExpired,
            _ => AuditKind::ExposureStopped,
        };
        self.audit.append(
            &AuditEvent::new(self.clock.now_iso(), audit_kind)
                .for_session(&record.id, record.kind.as_str())
                .with_details(serde_json::json!({
                    "reason": reason.detail(),
                    "stats": handle.shared.stats_snapshot(),
                })),
        );

        {
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions.remove(id);
        }
        self.persist_snapshot();

        info!("session {id} -> {}", status.as_str());
        Ok(workspace)
    }

    /// Retire every running session whose expiry has passed.
    pub(crate) async fn reap_expired(self: &Arc<Self>) -> usize {
        let now = self.clock.now();
        // Snapshot, then act: the table cannot be mutated mid-iteration.
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions
                .values()
                .filter_map(|handle| {
                    let record = handle.record_snapshot();
                    if record.status != SessionStatus::Running {
                        return None;
                    }
                    let expires = DateTime::parse_from_rfc3339(&record.expires_at).ok()?;
                    (expires <= now.fixed_offset()).then_some(record.id)
                })
                .collect()
        };

        let mut reaped = 0;
        for id in expired {
            if self
                .terminate_session(&id, StopReason::Expired)
                .await
                .is_ok()
            {
                reaped += 1;
            }
        }
        reaped
    }

    pub(crate) fn persist_snapshot(&self) {
        let entries: Vec<SnapshotEntry> = {
            let sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions
                .values()
                .map(|handle| {
                    let record = handle.record_snapshot();
                    SnapshotEntry {
                        id: record.id,
                        kind: record.kind.as_str().to_string(),
                        status: record.status.as_str().to_string(),
                        expires_at: record.expires_at,
                        workspace_dir: record.workspace_dir,
                        process_pid: record.process_pid,
                    }
                })
                .collect()
        };
        self.audit.write_snapshot(&entries);
    }
}

/// Release every OS resource held in `resources`. Idempotent; cleanup
/// failures are logged and swallowed.
async fn release_resources(resources: &mut SessionResources) {
    if let Some(task) = resources.ttl_task.take() {
        task.abort();
    }
    if let Some(task) = resources.watcher_task.take() {
        task.abort();
    }
    if let Some(child) = resources.child.take() {
        terminate(&child).await;
    }
    if let Some(proxy) = resources.proxy.take() {
        proxy.shutdown().await;
    }
    if let Some(origin) = resources.origin.take() {
        origin.shutdown().await;
    }
    if let Some(workspace) = resources.workspace_dir.take() {
        if let Err(e) = fs::remove_dir_all(&workspace) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove workspace {:?}: {e}", workspace);
            }
        }
    }
}

fn spawn_stop_loop(inner: &Arc<ManagerInner>, mut stop_rx: mpsc::UnboundedReceiver<StopRequest>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(request) = stop_rx.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            match inner.terminate_session(&request.id, request.reason).await {
                Ok(_) => {}
                Err(_) => debug!("stop request for {} found no live session", request.id),
            }
        }
    });
}

fn spawn_reaper(inner: &Arc<ManagerInner>) {
    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    let period = inner.runtime.reaper_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh manager
        // does not reap before any session exists.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            let reaped = inner.reap_expired().await;
            if reaped > 0 {
                debug!("reaper retired {reaped} session(s)");
            }
        }
    });
}

/// Arm the per-session TTL timer; it pushes an expiry stop through the
/// same queue as every other termination source.
fn spawn_ttl_timer(
    stop_tx: mpsc::UnboundedSender<StopRequest>,
    id: String,
    ttl: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(ttl)).await;
        let _ = stop_tx.send(StopRequest {
            id,
            reason: StopReason::Expired,
        });
    })
}

/// Poll the tunnel child; when it exits while the session is live, push an
/// agent-exit stop.
fn spawn_child_watcher(
    inner: &Arc<ManagerInner>,
    id: String,
    child: Arc<TokioMutex<Option<Child>>>,
) -> JoinHandle<()> {
    let stop_tx = inner.stop_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let mut guard = child.lock().await;
            match guard.as_mut() {
                // Terminated through the normal path.
                None => break,
                Some(c) => match c.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        drop(guard);
                        let _ = stop_tx.send(StopRequest {
                            id,
                            reason: StopReason::AgentExit(format!(
                                "tunnel agent exited: {status}"
                            )),
                        });
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("child watcher wait failed: {e}");
                        break;
                    }
                },
            }
        }
    })
}

fn restrict_permissions(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
    }
}

//! Tunnel agent supervision.
//!
//! Spawns the external quick-tunnel agent against a local origin port,
//! pumps its stdout/stderr line by line into the session log, and waits
//! for the readiness URL. Spawning is wrapped in a bounded retry; the
//! previous child is terminated between attempts. Termination is SIGTERM
//! first, SIGKILL after 2.5 seconds.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, SecondsFormat};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::error::TunnelError;
use super::url::extract_quick_tunnel_url;
use crate::policy::{EdgeIpVersion, TunnelProtocol};
use crate::session::record::{LogComponent, SessionShared};

/// Default agent binary name, resolved via PATH.
pub const DEFAULT_AGENT: &str = "cloudflared";

/// How long to wait for the readiness URL.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(2_500);

/// Spawn attempts before giving up.
pub const DEFAULT_ATTEMPTS: u32 = 2;

/// Settings for one tunnel launch.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Resolved agent binary.
    pub agent_path: PathBuf,
    /// `--edge-ip-version` value.
    pub edge_ip_version: EdgeIpVersion,
    /// `--protocol` value.
    pub protocol: TunnelProtocol,
    /// Spawn attempts.
    pub attempts: u32,
    /// Readiness timeout per attempt.
    pub ready_timeout: Duration,
}

impl TunnelSettings {
    /// Settings with default retry/timeout bounds.
    pub fn new(agent_path: PathBuf, edge_ip_version: EdgeIpVersion, protocol: TunnelProtocol) -> Self {
        Self {
            agent_path,
            edge_ip_version,
            protocol,
            attempts: DEFAULT_ATTEMPTS,
            ready_timeout: READY_TIMEOUT,
        }
    }
}

/// A running tunnel.
#[derive(Debug)]
pub struct TunnelHandle {
    /// The announced public URL.
    pub public_url: String,
    /// Agent PID.
    pub pid: u32,
    /// The child process slot; emptied once reaped.
    pub child: Arc<Mutex<Option<Child>>>,
}

/// Resolve the agent binary: an explicit path must exist, otherwise the
/// default name is searched in PATH.
pub fn resolve_agent(override_path: Option<&Path>) -> Result<PathBuf, TunnelError> {
    match override_path {
        Some(path) => {
            if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(TunnelError::AgentNotFound(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
        }
        None => which::which(DEFAULT_AGENT).map_err(|e| {
            TunnelError::AgentNotFound(format!("'{DEFAULT_AGENT}' not found in PATH: {e}"))
        }),
    }
}

/// Extract the agent's semantic version from its `--version` output.
pub fn agent_version(agent_path: &Path) -> Option<String> {
    let output = std::process::Command::new(agent_path)
        .arg("--version")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let re = Regex::new(r"version\s+(\d+\.\d+\.\d+)").expect("version regex compiles");
    re.captures(&text).map(|c| c[1].to_string())
}

/// Launch the agent against `local_port`, retrying within bounds.
pub async fn start_tunnel(
    settings: &TunnelSettings,
    local_port: u16,
    shared: Arc<SessionShared>,
) -> Result<TunnelHandle, TunnelError> {
    let mut last_error = String::new();
    for attempt in 1..=settings.attempts.max(1) {
        debug!(
            "tunnel attempt {attempt}/{} for 127.0.0.1:{local_port}",
            settings.attempts
        );
        match spawn_attempt(settings, local_port, shared.clone()).await {
            Ok(handle) => {
                info!("tunnel ready at {} (pid {})", handle.public_url, handle.pid);
                return Ok(handle);
            }
            Err(e) => {
                warn!("tunnel attempt {attempt} failed: {e}");
                last_error = e.to_string();
            }
        }
    }
    Err(TunnelError::Startup {
        attempts: settings.attempts.max(1),
        last: last_error,
    })
}

async fn spawn_attempt(
    settings: &TunnelSettings,
    local_port: u16,
    shared: Arc<SessionShared>,
) -> Result<TunnelHandle, TunnelError> {
    let mut child = Command::new(&settings.agent_path)
        .arg("tunnel")
        .arg("--url")
        .arg(format!("http://127.0.0.1:{local_port}"))
        .arg("--edge-ip-version")
        .arg(settings.edge_ip_version.as_arg())
        .arg("--protocol")
        .arg(settings.protocol.as_arg())
        .arg("--no-autoupdate")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TunnelError::SpawnFailed)?;

    let pid = child
        .id()
        .ok_or_else(|| TunnelError::PrematureExit(" (no pid)".to_string()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    if let Some(stdout) = stdout {
        spawn_line_pump(stdout, shared.clone(), line_tx.clone());
    }
    if let Some(stderr) = stderr {
        spawn_line_pump(stderr, shared.clone(), line_tx);
    } else {
        // line_tx must not outlive the pumps, or recv() never observes EOF.
        drop(line_tx);
    }

    let child_slot = Arc::new(Mutex::new(Some(child)));

    let wait_for_url = async {
        while let Some(line) = line_rx.recv().await {
            if let Some(url) = extract_quick_tunnel_url(&line) {
                return Some(url);
            }
        }
        None
    };

    match tokio::time::timeout(settings.ready_timeout, wait_for_url).await {
        Ok(Some(public_url)) => Ok(TunnelHandle {
            public_url,
            pid,
            child: child_slot,
        }),
        Ok(None) => {
            // Both pumps hit EOF: the agent exited before announcing a URL.
            terminate(&child_slot).await;
            Err(TunnelError::PrematureExit(String::new()))
        }
        Err(_) => {
            terminate(&child_slot).await;
            Err(TunnelError::ReadyTimeout)
        }
    }
}

/// Pump one output stream line by line into the session log and the
/// readiness scanner. Lines split on `\n`/`\r\n`; a trailing unterminated
/// line is flushed at EOF.
fn spawn_line_pump<R>(
    stream: R,
    shared: Arc<SessionShared>,
    line_tx: mpsc::UnboundedSender<String>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r').to_string();
                    shared.log(now_iso(), LogComponent::Tunnel, line.clone());
                    let _ = line_tx.send(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("tunnel stream read error: {e}");
                    break;
                }
            }
        }
    });
}

/// Terminate the child: SIGTERM, then SIGKILL after 2.5 s. A no-op when
/// the child is already gone.
pub async fn terminate(child_slot: &Arc<Mutex<Option<Child>>>) {
    let mut guard = child_slot.lock().await;
    let Some(child) = guard.as_mut() else {
        return;
    };
    let Some(pid) = child.id() else {
        // Already reaped.
        guard.take();
        return;
    };

    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + TERM_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("tunnel agent {pid} exited: {status}");
                guard.take();
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("tunnel agent wait failed: {e}");
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    debug!("tunnel agent {pid} ignored SIGTERM, sending SIGKILL");
    let _ = child.kill().await;
    guard.take();
}

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessState, RateLimiter};
    use crate::policy::AccessMode;
    use crate::session::record::{ExposeKind, LogRing, SessionStats};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn shared() -> Arc<SessionShared> {
        let (stop_tx, _stop_rx) = mpsc::unbounded_channel();
        Arc::new(SessionShared {
            id: "port_test_aabbcc".to_string(),
            kind: ExposeKind::Port,
            access: AccessState::issue(AccessMode::None, false, Vec::new()),
            limiter: RateLimiter::disabled(),
            max_downloads: None,
            stats: std::sync::Mutex::new(SessionStats::default()),
            logs: LogRing::new(),
            stop_tx,
        })
    }

    /// Write an executable stub agent script.
    fn stub_agent(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-cloudflared");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn settings(agent: PathBuf) -> TunnelSettings {
        let mut s = TunnelSettings::new(agent, EdgeIpVersion::Auto, TunnelProtocol::Auto);
        s.ready_timeout = Duration::from_secs(5);
        s
    }

    #[tokio::test]
    async fn test_ready_url_from_stderr() {
        let dir = TempDir::new().unwrap();
        // cloudflared logs to stderr.
        let agent = stub_agent(
            &dir,
            "echo 'INF https://stub-label.trycloudflare.com registered' >&2\nsleep 30",
        );
        let shared = shared();

        let handle = start_tunnel(&settings(agent), 12345, shared.clone())
            .await
            .unwrap();
        assert_eq!(handle.public_url, "https://stub-label.trycloudflare.com");
        assert!(handle.pid > 0);

        // The announcement line landed in the session log.
        assert!(shared
            .logs
            .snapshot()
            .iter()
            .any(|entry| entry.line.contains("stub-label")));

        terminate(&handle.child).await;
        assert!(handle.child.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_premature_exit_fails_all_attempts() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, "echo 'no url here'\nexit 3");
        let result = start_tunnel(&settings(agent), 12345, shared()).await;
        match result {
            Err(TunnelError::Startup { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected Startup error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_when_agent_stays_silent() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, "sleep 60");
        let mut s = settings(agent);
        s.attempts = 1;
        s.ready_timeout = Duration::from_millis(400);

        let result = start_tunnel(&s, 12345, shared()).await;
        match result {
            Err(TunnelError::Startup { last, .. }) => {
                assert!(last.contains("timed_out_waiting_for_url"));
            }
            other => panic!("expected Startup error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blacklisted_api_url_is_not_readiness() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(
            &dir,
            "echo 'register https://api.trycloudflare.com'\n\
             echo 'ready https://good-one.trycloudflare.com'\nsleep 30",
        );
        let handle = start_tunnel(&settings(agent), 1, shared()).await.unwrap();
        assert_eq!(handle.public_url, "https://good-one.trycloudflare.com");
        terminate(&handle.child).await;
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, "echo 'https://x-y.trycloudflare.com'\nsleep 30");
        let handle = start_tunnel(&settings(agent), 1, shared()).await.unwrap();
        terminate(&handle.child).await;
        terminate(&handle.child).await;
        assert!(handle.child.lock().await.is_none());
    }

    #[test]
    fn test_resolve_agent_explicit_path_must_exist() {
        let missing = Path::new("/no/such/agent");
        assert!(matches!(
            resolve_agent(Some(missing)),
            Err(TunnelError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_agent_version_extraction() {
        let dir = TempDir::new().unwrap();
        let agent = stub_agent(&dir, "echo 'cloudflared version 2026.7.1 (built today)'");
        assert_eq!(agent_version(&agent), Some("2026.7.1".to_string()));
    }
}

//! Session records, bounded logs, stats, and id generation.
//!
//! A session splits into two pieces: the [`SessionRecord`] (pure data,
//! mutated under the manager's locks) and the [`SessionShared`] state that
//! request handlers and stream pumps touch concurrently (stats, logs, the
//! stop queue).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::access::AccessState;
use crate::access::RateLimiter;
use crate::netutil::base36_ms;
use crate::workspace::manifest::ManifestEntry;

/// Maximum retained log lines per session.
pub const LOG_CAPACITY: usize = 4_000;

/// Exposure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposeKind {
    /// A local TCP service.
    Port,
    /// A workspace of copied files.
    Files,
}

impl ExposeKind {
    /// The id prefix and audit `type` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposeKind::Port => "port",
            ExposeKind::Files => "files",
        }
    }
}

/// Session lifecycle states. Terminal transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Bring-up in progress.
    Starting,
    /// Publicly reachable.
    Running,
    /// Stopped by a client or quota.
    Stopped,
    /// Failed during bring-up or the agent died.
    Error,
    /// Retired by TTL.
    Expired,
}

impl SessionStatus {
    /// True for states that release all resources.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Error | SessionStatus::Expired
        )
    }

    /// Status string as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
            SessionStatus::Expired => "expired",
        }
    }
}

/// How files are presented by the static origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Presentation {
    /// Inline disposition; single-file and markdown shortcuts apply.
    #[default]
    Preview,
    /// Text-like types forced to `text/plain`, no disposition header.
    Raw,
    /// Attachment disposition.
    Download,
}

/// Whether the workspace is served file-by-file or as one zip bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    /// Serve individual files with an explorer index.
    #[default]
    Normal,
    /// Serve a single zip bundle with an index page.
    Zip,
}

/// Which component produced a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogComponent {
    /// The tunnel agent's stdout/stderr.
    Tunnel,
    /// The origin servers.
    Origin,
    /// The session manager itself.
    Manager,
}

/// One captured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp, ISO-8601 local offset.
    pub ts: String,
    /// Producing component.
    pub component: LogComponent,
    /// The line.
    pub line: String,
}

/// Bounded, thread-safe log ring.
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    /// Append a line, evicting the oldest entry at capacity.
    pub fn push(&self, ts: String, component: LogComponent, line: String) {
        let mut entries = self.entries.lock().expect("log ring lock poisoned");
        if entries.len() == LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            ts,
            component,
            line,
        });
    }

    /// Copy out the current contents.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .expect("log ring lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("log ring lock poisoned").len()
    }

    /// True when no lines have been captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic per-session counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Requests seen by the origin.
    pub requests: u64,
    /// Completed file/bundle downloads.
    pub downloads: u64,
    /// Response body bytes sent.
    pub bytes_sent: u64,
    /// Timestamp of the most recent request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_access_at: Option<String>,
}

/// Why a session is being terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Client-requested stop.
    User,
    /// TTL reached.
    Expired,
    /// Download quota reached.
    MaxDownloads,
    /// The tunnel agent exited while the session was running.
    AgentExit(String),
}

impl StopReason {
    /// The terminal status this reason produces.
    pub fn terminal_status(&self) -> SessionStatus {
        match self {
            StopReason::User | StopReason::MaxDownloads => SessionStatus::Stopped,
            StopReason::Expired => SessionStatus::Expired,
            StopReason::AgentExit(_) => SessionStatus::Error,
        }
    }

    /// Human-readable reason recorded in audit details.
    pub fn detail(&self) -> String {
        match self {
            StopReason::User => "user_stop".to_string(),
            StopReason::Expired => "expired".to_string(),
            StopReason::MaxDownloads => "max_downloads_reached".to_string(),
            StopReason::AgentExit(msg) => format!("agent_exit: {msg}"),
        }
    }
}

/// A termination request funneled into the manager's stop queue.
#[derive(Debug)]
pub struct StopRequest {
    /// Target session.
    pub id: String,
    /// Cause.
    pub reason: StopReason,
}

/// State shared between the manager, the origins, and the stream pumps.
pub struct SessionShared {
    /// Session id.
    pub id: String,
    /// Exposure type.
    pub kind: ExposeKind,
    /// Access control state (immutable after bring-up).
    pub access: AccessState,
    /// Per-IP rate limiter.
    pub limiter: RateLimiter,
    /// Download quota, when set.
    pub max_downloads: Option<u64>,
    /// Counters.
    pub stats: Mutex<SessionStats>,
    /// Bounded log ring.
    pub logs: LogRing,
    /// Stop queue into the manager.
    pub stop_tx: mpsc::UnboundedSender<StopRequest>,
}

impl SessionShared {
    /// Record a request arrival.
    pub fn note_request(&self, ts: String) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.requests += 1;
        stats.last_access_at = Some(ts);
    }

    /// Add transmitted body bytes.
    pub fn add_bytes_sent(&self, bytes: u64) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.bytes_sent += bytes;
    }

    /// Record a completed download and its bytes; enqueues a stop when the
    /// quota is reached.
    pub fn record_download(&self, ts: String, bytes: u64) {
        let downloads = {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.downloads += 1;
            stats.bytes_sent += bytes;
            stats.downloads
        };
        if let Some(max) = self.max_downloads {
            if downloads >= max {
                self.log(
                    ts,
                    LogComponent::Manager,
                    format!("download quota reached ({downloads}/{max}), stopping"),
                );
                let _ = self.stop_tx.send(StopRequest {
                    id: self.id.clone(),
                    reason: StopReason::MaxDownloads,
                });
            }
        }
    }

    /// Append a log line.
    pub fn log(&self, ts: String, component: LogComponent, line: String) {
        self.logs.push(ts, component, line);
    }

    /// Copy out the stats.
    pub fn stats_snapshot(&self) -> SessionStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }
}

/// The session's queryable data.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Session id (`<prefix>_<base36-ms>_<6 hex>`).
    pub id: String,
    /// Exposure type.
    pub kind: ExposeKind,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: String,
    /// Expiry timestamp (`created_at + ttl`).
    pub expires_at: String,
    /// Effective TTL, seconds.
    pub ttl_seconds: u64,
    /// The user-supplied port (port exposures).
    pub source_port: Option<u16>,
    /// The port the tunnel actually targets.
    pub origin_port: Option<u16>,
    /// `http://127.0.0.1:<origin port>` once an origin is up.
    pub local_url: Option<String>,
    /// The public quick-tunnel URL once running.
    pub public_url: Option<String>,
    /// Workspace directory (file exposures).
    pub workspace_dir: Option<PathBuf>,
    /// Presentation style (file exposures).
    pub presentation: Presentation,
    /// Share mode (file exposures).
    pub mode: ShareMode,
    /// Manifest (file exposures).
    pub manifest: Vec<ManifestEntry>,
    /// Download quota.
    pub max_downloads: Option<u64>,
    /// Last failure message, when `status = error`.
    pub last_error: Option<String>,
    /// Agent PID while running.
    pub process_pid: Option<u32>,
}

/// Generate a session id: `<prefix>_<base36 ms>_<6 hex chars>`.
pub fn new_session_id(prefix: &str, now_ms: u64) -> String {
    let mut bytes = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}_{}_{}", prefix, base36_ms(now_ms), hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AccessMode;

    fn shared(max_downloads: Option<u64>) -> (SessionShared, mpsc::UnboundedReceiver<StopRequest>) {
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        (
            SessionShared {
                id: "files_test_abc123".to_string(),
                kind: ExposeKind::Files,
                access: AccessState::issue(AccessMode::None, false, Vec::new()),
                limiter: RateLimiter::disabled(),
                max_downloads,
                stats: Mutex::new(SessionStats::default()),
                logs: LogRing::new(),
                stop_tx,
            },
            stop_rx,
        )
    }

    #[test]
    fn test_id_format() {
        let id = new_session_id("port", 1_700_000_000_000);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "port");
        assert_eq!(parts[1], "loyw3v28");
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = new_session_id("port", 1);
        let b = new_session_id("port", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_log_ring_caps_at_capacity() {
        let ring = LogRing::new();
        for i in 0..(LOG_CAPACITY + 100) {
            ring.push("t".into(), LogComponent::Tunnel, format!("line {i}"));
        }
        assert_eq!(ring.len(), LOG_CAPACITY);
        let snapshot = ring.snapshot();
        // Oldest entries were evicted.
        assert_eq!(snapshot[0].line, "line 100");
    }

    #[test]
    fn test_stats_are_monotonic() {
        let (shared, _rx) = shared(None);
        shared.note_request("t1".into());
        shared.note_request("t2".into());
        shared.add_bytes_sent(10);
        let stats = shared.stats_snapshot();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.last_access_at.as_deref(), Some("t2"));
    }

    #[test]
    fn test_download_quota_enqueues_stop() {
        let (shared, mut rx) = shared(Some(2));
        shared.record_download("t".into(), 1);
        assert!(rx.try_recv().is_err());
        shared.record_download("t".into(), 1);
        let req = rx.try_recv().unwrap();
        assert_eq!(req.reason, StopReason::MaxDownloads);
        assert_eq!(req.id, "files_test_abc123");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(StopReason::User.terminal_status(), SessionStatus::Stopped);
        assert_eq!(StopReason::Expired.terminal_status(), SessionStatus::Expired);
        assert_eq!(
            StopReason::MaxDownloads.terminal_status(),
            SessionStatus::Stopped
        );
        assert_eq!(
            StopReason::AgentExit("gone".into()).terminal_status(),
            SessionStatus::Error
        );
    }
}

//! Append-only audit log, session snapshots, and garbage collection.
//!
//! Writes are fail-soft: an audit append or snapshot write that fails is
//! logged and swallowed, never propagated into a lifecycle transition.
//! Reads are tolerant: malformed JSONL lines are skipped silently.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::events::{AuditEvent, AuditKind};
use crate::netutil::base36_ms;

/// Filename of the audit log under the state dir.
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Filename of the session snapshot under the state dir.
pub const SNAPSHOT_FILE: &str = "sessions.json";

/// Default and maximum query limits.
const DEFAULT_QUERY_LIMIT: usize = 500;
const MAX_QUERY_LIMIT: usize = 10_000;

/// One element of the `sessions.json` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Session id.
    pub id: String,
    /// Exposure type (`port` / `files`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Session status at snapshot time.
    pub status: String,
    /// Expiry timestamp.
    pub expires_at: String,
    /// Workspace directory, when the session owns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    /// Tunnel agent PID, when one is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_pid: Option<u32>,
}

/// Filters accepted by [`AuditStore::query`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    /// Match this event kind only.
    pub event: Option<String>,
    /// Match this session id only.
    pub id: Option<String>,
    /// Inclusive lower bound on `ts`.
    pub from: Option<String>,
    /// Inclusive upper bound on `ts`.
    pub until: Option<String>,
    /// Maximum events returned; clamped to [1, 10_000], default 500.
    pub limit: Option<usize>,
}

/// Audit and snapshot store for one state directory.
pub struct AuditStore {
    audit_path: PathBuf,
    snapshot_path: PathBuf,
    exports_dir: PathBuf,
    // Single writer for the append-only log and the snapshot.
    write_lock: Mutex<()>,
}

impl AuditStore {
    /// Create a store rooted at `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            audit_path: state_dir.join(AUDIT_FILE),
            snapshot_path: state_dir.join(SNAPSHOT_FILE),
            exports_dir: state_dir.join("exports"),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one event. Failures are logged, never raised.
    pub fn append(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to serialize audit event: {e}");
                return;
            }
        };
        let _guard = self.write_lock.lock().expect("audit write lock poisoned");
        if let Some(parent) = self.audit_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!("failed to append audit event: {e}");
        }
    }

    /// Read the audit file and return the last `limit` events matching the
    /// filter, preserving write order. Malformed lines are skipped.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);

        let contents = match fs::read_to_string(&self.audit_path) {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };

        let mut matching: Vec<AuditEvent> = contents
            .lines()
            .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
            .filter(|event| self.matches(event, filter))
            .collect();

        if matching.len() > limit {
            matching.drain(..matching.len() - limit);
        }
        matching
    }

    /// Export up to 10 000 filtered events as JSONL.
    ///
    /// Returns the output path and the number of events written, and
    /// records an `audit_exported` event stamped with `ts`.
    pub fn export(
        &self,
        filter: &AuditFilter,
        output_path: Option<PathBuf>,
        ts: String,
        now_ms: u64,
    ) -> std::io::Result<(PathBuf, usize)> {
        let mut filter = filter.clone();
        filter.limit = Some(MAX_QUERY_LIMIT);
        let events = self.query(&filter);

        let output_path = output_path.unwrap_or_else(|| {
            self.exports_dir
                .join(format!("audit-{}.jsonl", base36_ms(now_ms)))
        });
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = String::new();
        for event in &events {
            if let Ok(line) = serde_json::to_string(event) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        fs::write(&output_path, out)?;

        self.append(
            &AuditEvent::new(ts, AuditKind::AuditExported).with_details(serde_json::json!({
                "output_path": output_path,
                "events": events.len(),
            })),
        );

        Ok((output_path, events.len()))
    }

    /// Replace the snapshot with the given live table. Failures are logged,
    /// never raised; the next transition retries.
    pub fn write_snapshot(&self, entries: &[SnapshotEntry]) {
        let _guard = self.write_lock.lock().expect("audit write lock poisoned");
        let result = serde_json::to_string_pretty(entries)
            .map_err(std::io::Error::other)
            .and_then(|pretty| {
                if let Some(parent) = self.snapshot_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let tmp = self.snapshot_path.with_extension("json.tmp");
                fs::write(&tmp, pretty)?;
                fs::rename(&tmp, &self.snapshot_path)
            });
        if let Err(e) = result {
            warn!("failed to write session snapshot: {e}");
        }
    }

    /// Read the last snapshot; missing or corrupt files yield an empty list.
    pub fn read_snapshot(&self) -> Vec<SnapshotEntry> {
        fs::read_to_string(&self.snapshot_path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    fn matches(&self, event: &AuditEvent, filter: &AuditFilter) -> bool {
        if let Some(kind) = &filter.event {
            let event_kind = serde_json::to_value(event.event)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            if &event_kind != kind {
                return false;
            }
        }
        if let Some(id) = &filter.id {
            if event.id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(from) = &filter.from {
            if ts_cmp(&event.ts, from) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(until) = &filter.until {
            if ts_cmp(&event.ts, until) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        true
    }
}

/// Compare two timestamps numerically when both parse, lexically otherwise.
///
/// The lexical fallback tolerates legacy records; fixed-offset ISO-8601
/// strings order lexicographically within one offset.
fn ts_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    match (
        chrono::DateTime::parse_from_rfc3339(a),
        chrono::DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Remove every subdirectory of `workspaces_root` not referenced by a live
/// session. Returns the removed paths.
pub fn sweep_orphan_workspaces(workspaces_root: &Path, live_ids: &HashSet<String>) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let entries = match fs::read_dir(workspaces_root) {
        Ok(entries) => entries,
        Err(_) => return removed,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if live_ids.contains(&name) {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!("gc removed orphan workspace {:?}", path);
                removed.push(path);
            }
            Err(e) => warn!("gc failed to remove {:?}: {e}", path),
        }
    }
    removed
}

/// Probe a recorded PID with signal 0 and send SIGTERM if it is alive.
/// Returns true when a TERM was sent.
pub fn terminate_stale_pid(pid: u32) -> bool {
    let pid = Pid::from_raw(pid as i32);
    if kill(pid, None).is_err() {
        return false;
    }
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => {
            debug!("gc sent SIGTERM to stale pid {pid}");
            true
        }
        Err(e) => {
            warn!("gc failed to signal pid {pid}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(ts: &str, kind: AuditKind, id: Option<&str>) -> AuditEvent {
        let mut e = AuditEvent::new(ts.to_string(), kind);
        e.id = id.map(str::to_string);
        e
    }

    #[test]
    fn test_append_and_query_roundtrip() {
        let dir = tempdir().unwrap();
        let store = AuditStore::new(dir.path());
        store.append(&event("2026-01-01T00:00:00.000+00:00", AuditKind::ExposureStarted, Some("a")));
        store.append(&event("2026-01-01T00:00:01.000+00:00", AuditKind::ExposureStopped, Some("a")));

        let all = store.query(&AuditFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event, AuditKind::ExposureStarted);
        assert_eq!(all[1].event, AuditKind::ExposureStopped);
    }

    #[test]
    fn test_query_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let store = AuditStore::new(dir.path());
        store.append(&event("2026-01-01T00:00:00.000+00:00", AuditKind::GcRun, None));
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(AUDIT_FILE))
            .unwrap();
        writeln!(file, "this is not json").unwrap();
        store.append(&event("2026-01-01T00:00:02.000+00:00", AuditKind::GcRun, None));

        let all = store.query(&AuditFilter::default());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_query_filters_by_event_and_id() {
        let dir = tempdir().unwrap();
        let store = AuditStore::new(dir.path());
        store.append(&event("2026-01-01T00:00:00.000+00:00", AuditKind::ExposureStarted, Some("a")));
        store.append(&event("2026-01-01T00:00:01.000+00:00", AuditKind::ExposureStarted, Some("b")));
        store.append(&event("2026-01-01T00:00:02.000+00:00", AuditKind::ExposureStopped, Some("a")));

        let filter = AuditFilter {
            event: Some("exposure_started".to_string()),
            id: Some("a".to_string()),
            ..Default::default()
        };
        let matching = store.query(&filter);
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id.as_deref(), Some("a"));
    }

    #[test]
    fn test_query_time_window() {
        let dir = tempdir().unwrap();
        let store = AuditStore::new(dir.path());
        for (i, ts) in [
            "2026-01-01T00:00:00.000+00:00",
            "2026-01-01T00:01:00.000+00:00",
            "2026-01-01T00:02:00.000+00:00",
        ]
        .iter()
        .enumerate()
        {
            store.append(&event(ts, AuditKind::GcRun, Some(&format!("s{i}"))));
        }
        let filter = AuditFilter {
            from: Some("2026-01-01T00:00:30.000+00:00".to_string()),
            until: Some("2026-01-01T00:01:30.000+00:00".to_string()),
            ..Default::default()
        };
        let matching = store.query(&filter);
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_time_filter_mixes_offsets_numerically() {
        // 01:00 +01:00 equals 00:00 Z; a lexical comparison would order
        // these incorrectly.
        assert_eq!(
            ts_cmp("2026-01-01T01:00:00.000+01:00", "2026-01-01T00:00:00.000Z"),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_limit_keeps_last_events() {
        let dir = tempdir().unwrap();
        let store = AuditStore::new(dir.path());
        for i in 0..10 {
            store.append(&event(
                &format!("2026-01-01T00:00:0{i}.000+00:00"),
                AuditKind::GcRun,
                Some(&format!("s{i}")),
            ));
        }
        let filter = AuditFilter {
            limit: Some(3),
            ..Default::default()
        };
        let matching = store.query(&filter);
        assert_eq!(matching.len(), 3);
        assert_eq!(matching[0].id.as_deref(), Some("s7"));
        assert_eq!(matching[2].id.as_deref(), Some("s9"));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = AuditStore::new(dir.path());
        let entries = vec![SnapshotEntry {
            id: "files_x_abcdef".to_string(),
            kind: "files".to_string(),
            status: "running".to_string(),
            expires_at: "2026-01-01T01:00:00.000+00:00".to_string(),
            workspace_dir: Some(PathBuf::from("/tmp/ws/files_x_abcdef")),
            process_pid: Some(4242),
        }];
        store.write_snapshot(&entries);
        let back = store.read_snapshot();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].id, "files_x_abcdef");
        assert_eq!(back[0].process_pid, Some(4242));
    }

    #[test]
    fn test_export_writes_jsonl_and_records_event() {
        let dir = tempdir().unwrap();
        let store = AuditStore::new(dir.path());
        store.append(&event("2026-01-01T00:00:00.000+00:00", AuditKind::GcRun, None));

        let (path, count) = store
            .export(
                &AuditFilter::default(),
                None,
                "2026-01-01T00:00:01.000+00:00".to_string(),
                1_700_000_000_000,
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(path.starts_with(dir.path().join("exports")));
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);

        // The export itself is audited.
        let all = store.query(&AuditFilter::default());
        assert_eq!(all.last().unwrap().event, AuditKind::AuditExported);
    }

    #[test]
    fn test_sweep_orphan_workspaces() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("workspaces");
        fs::create_dir_all(root.join("live_session")).unwrap();
        fs::create_dir_all(root.join("dead_session")).unwrap();

        let live: HashSet<String> = ["live_session".to_string()].into_iter().collect();
        let removed = sweep_orphan_workspaces(&root, &live);

        assert_eq!(removed.len(), 1);
        assert!(root.join("live_session").exists());
        assert!(!root.join("dead_session").exists());
    }
}

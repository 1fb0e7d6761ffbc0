//! End-to-end lifecycle tests.
//!
//! These drive the real manager against a stub tunnel agent (a shell
//! script that prints a quick-tunnel URL and then sleeps), real origin
//! servers on localhost, and a manually advanced clock for TTL expiry.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cfshare::audit::AuditFilter;
use cfshare::runtime::RuntimeConfig;
use cfshare::session::{
    Clock, ExposeFilesParams, ExposeOpts, ExposePortParams, ExposureManager, GetParams,
    LogsParams, ManualClock, StopParams,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Stub agent: announce a URL on stderr (like the real agent), then park.
fn write_stub_agent(dir: &Path) -> PathBuf {
    let path = dir.join("stub-cloudflared");
    fs::write(
        &path,
        "#!/bin/sh\n\
         echo \"INF registered https://stub-egg-plant.trycloudflare.com\" >&2\n\
         exec sleep 600\n",
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_runtime(state: &Path, agent: PathBuf) -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    runtime.state_dir = state.to_path_buf();
    runtime.agent_path = Some(agent);
    // The explicit reap calls in these tests must be the only reaper.
    runtime.reaper_interval = Duration::from_secs(3_600);
    runtime.ready_timeout = Duration::from_secs(5);
    runtime
}

struct Harness {
    _state: TempDir,
    _bin: TempDir,
    manager: ExposureManager,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let state = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let agent = write_stub_agent(bin.path());
    let clock = Arc::new(ManualClock::starting_now());
    let manager =
        ExposureManager::with_clock(test_runtime(state.path(), agent), clock.clone()).unwrap();
    Harness {
        _state: state,
        _bin: bin,
        manager,
        clock,
    }
}

async fn http_get(port: u16, path: &str, extra: &str) -> (u16, String, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let raw =
        format!("GET {path} HTTP/1.1\r\nhost: localhost\r\n{extra}connection: close\r\n\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response).into_owned();
    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((&response, ""));
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    (status, head.to_string(), body.to_string())
}

fn files_params(paths: Vec<PathBuf>, opts: ExposeOpts) -> ExposeFilesParams {
    ExposeFilesParams {
        paths,
        opts: Some(opts),
    }
}

fn opts_from(value: Value) -> ExposeOpts {
    serde_json::from_value(value).unwrap()
}

async fn wait_for_gone(manager: &ExposureManager, id: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if manager.session(id).is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn expose_files_full_lifecycle() {
    let h = harness();
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("a.txt"), "A").unwrap();

    let result = h
        .manager
        .expose_files(files_params(
            vec![data.path().join("a.txt")],
            opts_from(json!({"access": "none", "ttl_seconds": 120})),
        ))
        .await
        .unwrap();

    assert_eq!(result["status"], "running");
    let url = result["public_url"].as_str().unwrap();
    let re = regex::Regex::new(r"^https://[a-z0-9-]+\.trycloudflare\.com$").unwrap();
    assert!(re.is_match(url), "unexpected public url {url}");

    let id = result["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("files_"));
    let workspace = PathBuf::from(result["workspace_dir"].as_str().unwrap());
    assert!(workspace.exists());

    // Single file + preview: root serves the file directly.
    let origin_port = result["origin_port"].as_u64().unwrap() as u16;
    let (status, _, body) = http_get(origin_port, "/", "").await;
    assert_eq!(status, 200);
    assert_eq!(body, "A");

    // Stop, and verify the terminal transition released everything.
    let stopped = h
        .manager
        .stop(StopParams {
            id: Some(id.clone()),
            ids: None,
        })
        .await
        .unwrap();
    assert_eq!(stopped["stopped"][0], json!(id.clone()));
    assert!(!workspace.exists());
    assert!(h.manager.session(&id).is_none());

    // A second stop observes not_found.
    let again = h
        .manager
        .stop(StopParams {
            id: Some(id.clone()),
            ids: None,
        })
        .await
        .unwrap();
    assert_eq!(again["failed"][0]["error"], "not_found");

    // Exactly one started and one stopped event for the session.
    let events = h.manager.audit_query(AuditFilter {
        id: Some(id),
        ..Default::default()
    });
    let kinds: Vec<String> = events["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, vec!["exposure_started", "exposure_stopped"]);
}

#[tokio::test]
async fn expose_port_with_token_gates_origin() {
    let h = harness();

    // Throwaway upstream answering 200 "hi".
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nhi",
                    )
                    .await;
            });
        }
    });

    let result = h
        .manager
        .expose_port(ExposePortParams {
            port: upstream_port as f64,
            opts: Some(opts_from(json!({"access": "token", "ttl_seconds": 120}))),
        })
        .await
        .unwrap();

    assert_eq!(result["status"], "running");
    assert_eq!(result["source_port"].as_u64().unwrap() as u16, upstream_port);

    // The token is masked in access_info and full in credentials.
    let masked = result["access_info"]["token"].as_str().unwrap();
    assert!(masked.contains("***"));
    let token = result["credentials"]["token"].as_str().unwrap().to_string();
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    // expires_at is about now + 120 s.
    let expires = chrono::DateTime::parse_from_rfc3339(result["expires_at"].as_str().unwrap())
        .unwrap();
    let delta = (expires - h.clock.now().fixed_offset()).num_seconds();
    assert!((115..=125).contains(&delta), "expires in {delta}s");

    // The tunnel targets an auth-enforcing proxy, not the service itself.
    let proxy_port = result["origin_port"].as_u64().unwrap() as u16;
    assert_ne!(proxy_port, upstream_port);

    let (status, _, _) = http_get(proxy_port, "/", "").await;
    assert_eq!(status, 401);
    let (status, _, body) = http_get(proxy_port, &format!("/?token={token}"), "").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hi");

    h.manager
        .stop(StopParams {
            id: Some("all".into()),
            ids: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn blocked_port_is_rejected_without_a_session() {
    let h = harness();
    let err = h
        .manager
        .expose_port(ExposePortParams {
            port: 22.0,
            opts: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("port blocked by policy: 22"));
    assert!(!h.manager.has_live_sessions());
    // No audit event was written.
    let events = h.manager.audit_query(AuditFilter::default());
    assert_eq!(events["count"], 0);
}

#[tokio::test]
async fn out_of_range_ports_are_invalid_input() {
    let h = harness();
    for port in [0.0, 65_536.0, -3.0] {
        let err = h
            .manager
            .expose_port(ExposePortParams { port, opts: None })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }
}

#[tokio::test]
async fn unreachable_port_is_local_unreachable() {
    let h = harness();
    let free = cfshare::netutil::find_free_port().unwrap();
    let err = h
        .manager
        .expose_port(ExposePortParams {
            port: free as f64,
            opts: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "local_unreachable");
}

#[tokio::test]
async fn ttl_expiry_reaps_session() {
    let h = harness();
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("a.txt"), "A").unwrap();

    let result = h
        .manager
        .expose_files(files_params(
            vec![data.path().join("a.txt")],
            opts_from(json!({"access": "none", "ttl_seconds": 60})),
        ))
        .await
        .unwrap();
    let id = result["id"].as_str().unwrap().to_string();
    let workspace = PathBuf::from(result["workspace_dir"].as_str().unwrap());

    // Not expired yet.
    assert_eq!(h.manager.reap_expired().await, 0);

    h.clock.advance_secs(61);
    assert_eq!(h.manager.reap_expired().await, 1);

    assert!(h.manager.session(&id).is_none());
    assert!(!workspace.exists());

    let events = h.manager.audit_query(AuditFilter {
        id: Some(id),
        event: Some("exposure_expired".into()),
        ..Default::default()
    });
    assert_eq!(events["count"], 1);
}

#[tokio::test]
async fn max_downloads_stops_session() {
    let h = harness();
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("a.txt"), "A").unwrap();

    let result = h
        .manager
        .expose_files(files_params(
            vec![data.path().join("a.txt")],
            opts_from(json!({"access": "none", "max_downloads": 1, "presentation": "raw"})),
        ))
        .await
        .unwrap();
    let id = result["id"].as_str().unwrap().to_string();
    let origin_port = result["origin_port"].as_u64().unwrap() as u16;

    let (status, _, body) = http_get(origin_port, "/a.txt", "").await;
    assert_eq!(status, 200);
    assert_eq!(body, "A");

    // The quota stop lands within a second.
    assert!(wait_for_gone(&h.manager, &id, Duration::from_secs(1)).await);

    // The origin is gone; a fresh connection is refused.
    assert!(TcpStream::connect(("127.0.0.1", origin_port)).await.is_err());
}

#[tokio::test]
async fn zip_mode_bundles_workspace() {
    let h = harness();
    let data = TempDir::new().unwrap();
    fs::create_dir_all(data.path().join("x")).unwrap();
    fs::write(data.path().join("x/a.txt"), "A").unwrap();
    fs::write(data.path().join("x/b.txt"), "B").unwrap();

    let result = h
        .manager
        .expose_files(files_params(
            vec![data.path().join("x")],
            opts_from(json!({"access": "none", "mode": "zip"})),
        ))
        .await
        .unwrap();

    // The manifest is a single entry referencing the bundle.
    let manifest = result["manifest"].as_array().unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0]["name"], "download.zip");
    assert_eq!(manifest[0]["relative_url"], "/download.zip");

    let origin_port = result["origin_port"].as_u64().unwrap() as u16;

    // Root serves the index page.
    let (status, head, body) = http_get(origin_port, "/", "").await;
    assert_eq!(status, 200);
    assert!(head.to_lowercase().contains("text/html; charset=utf-8"));
    assert!(body.contains("/download.zip"));

    // The bundle contains both files under their workspace paths.
    let (status, _, body) = http_get(origin_port, "/download.zip", "").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("PK"));
    assert!(body.contains("x/a.txt"));
    assert!(body.contains("x/b.txt"));

    h.manager
        .stop(StopParams {
            id: Some("all".into()),
            ids: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn agent_exit_transitions_to_error() {
    let state = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    // Agent announces readiness and then dies shortly after.
    let agent = bin.path().join("flaky-cloudflared");
    fs::write(
        &agent,
        "#!/bin/sh\n\
         echo \"https://flaky-agent.trycloudflare.com\"\n\
         exec sleep 1\n",
    )
    .unwrap();
    fs::set_permissions(&agent, fs::Permissions::from_mode(0o755)).unwrap();

    let clock = Arc::new(ManualClock::starting_now());
    let manager =
        ExposureManager::with_clock(test_runtime(state.path(), agent), clock).unwrap();

    let data = TempDir::new().unwrap();
    fs::write(data.path().join("a.txt"), "A").unwrap();
    let result = manager
        .expose_files(files_params(
            vec![data.path().join("a.txt")],
            opts_from(json!({"access": "none"})),
        ))
        .await
        .unwrap();
    let id = result["id"].as_str().unwrap().to_string();

    // The watcher notices the exit and runs the error transition.
    assert!(wait_for_gone(&manager, &id, Duration::from_secs(5)).await);

    let events = manager.audit_query(AuditFilter {
        id: Some(id),
        event: Some("exposure_stopped".into()),
        ..Default::default()
    });
    assert_eq!(events["count"], 1);
    let detail = events["events"][0]["details"]["reason"].as_str().unwrap();
    assert!(detail.contains("agent_exit"));
}

#[tokio::test]
async fn get_and_logs_queries() {
    let h = harness();
    let data = TempDir::new().unwrap();
    fs::write(data.path().join("a.txt"), "A").unwrap();

    let result = h
        .manager
        .expose_files(files_params(
            vec![data.path().join("a.txt")],
            opts_from(json!({"access": "none"})),
        ))
        .await
        .unwrap();
    let id = result["id"].as_str().unwrap().to_string();

    // get by id.
    let got = h
        .manager
        .get(GetParams {
            id: Some(id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(got["sessions"][0]["id"], json!(id.clone()));
    assert_eq!(got["truncated"], false);

    // get with projection keeps id plus the requested fields.
    let got = h
        .manager
        .get(GetParams {
            id: Some(id.clone()),
            fields: Some(vec!["status".into(), "public_url".into()]),
            ..Default::default()
        })
        .await
        .unwrap();
    let view = got["sessions"][0].as_object().unwrap();
    assert_eq!(view.len(), 3);
    assert!(view.contains_key("id"));
    assert!(view.contains_key("status"));

    // get by filter.
    let got = h
        .manager
        .get(GetParams {
            filter: Some(serde_json::from_value(json!({"type": "files"})).unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(got["sessions"].as_array().unwrap().len(), 1);

    // Unknown id is not_found.
    let err = h
        .manager
        .get(GetParams {
            id: Some("files_nope_000000".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    // Logs: the tunnel announcement line is captured.
    let logs = h
        .manager
        .logs(LogsParams {
            id: Some(id.clone()),
            component: Some("tunnel".into()),
            ..Default::default()
        })
        .unwrap();
    let lines = logs["sessions"][0]["lines"].as_array().unwrap();
    assert!(lines
        .iter()
        .any(|l| l["line"].as_str().unwrap().contains("trycloudflare.com")));

    h.manager
        .stop(StopParams {
            id: Some(id),
            ids: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn gc_removes_orphan_workspaces() {
    let h = harness();
    let workspaces = h.manager.env_check();
    let state_dir = PathBuf::from(workspaces["state_dir"]["path"].as_str().unwrap());
    let orphan = state_dir.join("workspaces").join("files_dead_beef00");
    fs::create_dir_all(&orphan).unwrap();

    let result = h.manager.run_gc().await;
    assert!(!orphan.exists());
    let removed = result["removed_workspaces"].as_array().unwrap();
    assert_eq!(removed.len(), 1);

    let events = h.manager.audit_query(AuditFilter {
        event: Some("gc_run".into()),
        ..Default::default()
    });
    assert_eq!(events["count"], 1);
}

#[tokio::test]
async fn policy_update_roundtrip() {
    let h = harness();
    let updated = h
        .manager
        .policy_update(json!({"rate_limit": {"enabled": true, "max_requests": 5}}))
        .unwrap();
    assert_eq!(updated["policy"]["rate_limit"]["enabled"], true);
    assert_eq!(updated["policy"]["rate_limit"]["max_requests"], 5);
    // Unpatched nested fields survive.
    assert_eq!(updated["policy"]["rate_limit"]["window_ms"], 60_000);

    let shown = h.manager.policy_show();
    assert_eq!(shown["policy"]["rate_limit"]["enabled"], true);

    let events = h.manager.audit_query(AuditFilter {
        event: Some("policy_updated".into()),
        ..Default::default()
    });
    assert_eq!(events["count"], 1);
}

//! Port and path utilities.
//!
//! Small leaf helpers shared by the origins, the workspace builder, and the
//! session manager: ephemeral port allocation, local liveness probing,
//! lexical path containment, and filename sanitization.

use std::net::{SocketAddr, TcpListener};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

/// Timeout for local port liveness probes.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1200);

/// Errors from port allocation.
#[derive(Debug, Error)]
pub enum NetUtilError {
    /// The OS could not hand out an ephemeral port.
    #[error("port_allocation_failed: {0}")]
    PortAllocationFailed(#[source] std::io::Error),
}

/// Ask the OS for a free ephemeral TCP port on 127.0.0.1.
///
/// The probe socket is closed before returning, so the port is free at the
/// time of return but may race with other allocators on a busy host.
pub fn find_free_port() -> Result<u16, NetUtilError> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .map_err(NetUtilError::PortAllocationFailed)?;
    let port = listener
        .local_addr()
        .map_err(NetUtilError::PortAllocationFailed)?
        .port();
    drop(listener);
    Ok(port)
}

/// Probe whether something is listening on 127.0.0.1:`port`.
///
/// Non-blocking connect with a 1.2 s timeout; any connect error or timeout
/// is reported as unreachable.
pub async fn probe_local_port(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // `..` above the root stays unresolvable; keep it so the
                    // containment check below fails.
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True iff `child` is lexically contained in `parent` after both are
/// normalized. A path is considered contained in itself.
pub fn is_sub_path(child: &Path, parent: &Path) -> bool {
    let child = normalize(child);
    let parent = normalize(parent);
    child.starts_with(&parent)
}

/// Replace any character outside `[A-Za-z0-9._-]` with `_` and collapse
/// runs of underscores. Returns `"file"` for names that sanitize to nothing.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;
    for ch in name.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Render a millisecond timestamp in base 36, as used in generated ids and
/// export filenames.
pub fn base36_ms(mut ms: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if ms == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while ms > 0 {
        out.push(DIGITS[(ms % 36) as usize]);
        ms /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

//! Workspace construction for file exposures.
//!
//! User-supplied paths are resolved (symlinks followed), validated against
//! the ignore matcher and the allowed-roots policy, and copied into the
//! session's private workspace directory under sanitized names. The session
//! owns the workspace exclusively; it is deleted on any terminal
//! transition.

pub mod manifest;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::netutil::{is_sub_path, sanitize_filename};
use crate::policy::{IgnoreMatcher, Policy};

/// Errors during workspace construction.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Input does not exist or cannot be resolved.
    #[error("input not found: {0}")]
    NotFound(PathBuf),

    /// Input is blocked by an ignore pattern.
    #[error("path blocked by ignore rules: {0}")]
    Ignored(PathBuf),

    /// Input lies outside every allowed path root.
    #[error("path outside allowed roots: {0}")]
    OutsideAllowedRoots(PathBuf),

    /// Input is neither a regular file nor a directory.
    #[error("unsupported input type: {0}")]
    UnsupportedType(PathBuf),

    /// Filesystem failure while copying.
    #[error("copy failed for {path:?}: {source}")]
    Copy {
        /// Path being copied.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// One accepted input after copying.
#[derive(Debug, Clone)]
pub struct CopiedInput {
    /// The resolved source path.
    pub source: PathBuf,
    /// Base name inside the workspace.
    pub name: String,
    /// Whether the input was a directory.
    pub is_dir: bool,
}

/// Resolve, validate, and copy `inputs` into `workspace_dir`.
///
/// Name collisions between inputs are resolved by appending `_1`, `_2`, …
/// to the sanitized base name. Entries inside copied directories that match
/// the ignore rules are skipped.
pub fn build_workspace(
    inputs: &[PathBuf],
    workspace_dir: &Path,
    policy: &Policy,
    matcher: &IgnoreMatcher,
) -> Result<Vec<CopiedInput>, WorkspaceError> {
    fs::create_dir_all(workspace_dir).map_err(|source| WorkspaceError::Copy {
        path: workspace_dir.to_path_buf(),
        source,
    })?;

    let mut taken: HashSet<String> = HashSet::new();
    let mut copied = Vec::with_capacity(inputs.len());

    for input in inputs {
        let resolved = fs::canonicalize(input).map_err(|_| WorkspaceError::NotFound(input.clone()))?;
        let metadata = fs::metadata(&resolved).map_err(|_| WorkspaceError::NotFound(input.clone()))?;
        let is_dir = metadata.is_dir();

        if !is_dir && !metadata.is_file() {
            return Err(WorkspaceError::UnsupportedType(resolved));
        }
        if matcher.is_ignored(&resolved, is_dir) {
            return Err(WorkspaceError::Ignored(resolved));
        }
        if !policy.allowed_path_roots.is_empty()
            && !policy
                .allowed_path_roots
                .iter()
                .any(|root| is_sub_path(&resolved, root))
        {
            return Err(WorkspaceError::OutsideAllowedRoots(resolved));
        }

        let base = sanitize_filename(
            &resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string()),
        );
        let name = unique_name(&base, &mut taken);
        let dest = workspace_dir.join(&name);

        if is_dir {
            copy_dir_filtered(&resolved, &dest, matcher)?;
        } else {
            fs::copy(&resolved, &dest).map_err(|source| WorkspaceError::Copy {
                path: resolved.clone(),
                source,
            })?;
        }
        debug!("copied {:?} -> {:?}", resolved, dest);

        copied.push(CopiedInput {
            source: resolved,
            name,
            is_dir,
        });
    }

    Ok(copied)
}

/// Pick a workspace base name, suffixing `_1`, `_2`, … on collision.
fn unique_name(base: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    // Keep the extension at the end so served names stay recognizable.
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (base.to_string(), String::new()),
    };
    for i in 1.. {
        let candidate = format!("{stem}_{i}{ext}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
    }
    unreachable!("collision counter exhausted")
}

/// Recursively copy a directory, skipping ignored entries.
fn copy_dir_filtered(
    src: &Path,
    dest: &Path,
    matcher: &IgnoreMatcher,
) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| WorkspaceError::Copy {
            path: src.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        if path == src {
            fs::create_dir_all(dest).map_err(|source| WorkspaceError::Copy {
                path: dest.to_path_buf(),
                source,
            })?;
            continue;
        }
        let is_dir = entry.file_type().is_dir();
        if matcher.is_ignored(path, is_dir) {
            debug!("skipping ignored entry {:?}", path);
            continue;
        }
        let rel = path.strip_prefix(src).expect("walkdir yields children of src");
        // A child of an ignored directory is skipped even when the child
        // itself does not match.
        if rel
            .ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty())
            .any(|ancestor| matcher.is_ignored(&src.join(ancestor), true))
        {
            continue;
        }
        let target = dest.join(rel);
        if is_dir {
            fs::create_dir_all(&target).map_err(|source| WorkspaceError::Copy {
                path: target.clone(),
                source,
            })?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| WorkspaceError::Copy {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::copy(path, &target).map_err(|source| WorkspaceError::Copy {
                path: path.to_path_buf(),
                source,
            })?;
        }
        // Sockets, fifos, and dangling links are silently dropped.
    }
    Ok(())
}

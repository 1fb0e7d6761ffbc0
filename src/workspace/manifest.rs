//! Manifest construction and zip bundling.
//!
//! The manifest catalogs every regular file under the workspace with its
//! POSIX-relative name, size, SHA-256, percent-encoded URL, and mtime. In
//! zip mode a `_cfshare_bundle.zip` is produced containing every workspace
//! file at its workspace-relative path.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// On-disk name of the zip bundle inside the workspace.
pub const BUNDLE_NAME: &str = "_cfshare_bundle.zip";

/// Public name the bundle is served under.
pub const BUNDLE_URL_NAME: &str = "download.zip";

/// Errors during manifest construction or bundling.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Filesystem failure while walking or hashing.
    #[error("manifest build failed for {path:?}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Zip writer failure.
    #[error("zip bundling failed: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// One manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Workspace-relative, POSIX-separated name.
    pub name: String,
    /// File size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Percent-encoded URL path (leading `/`).
    pub relative_url: String,
    /// File mtime, ISO-8601 with local offset.
    pub modified_at: String,
}

/// Walk `workspace_dir` and build manifest entries for every regular file,
/// sorted by name. The zip bundle, when present, is excluded; callers add
/// its synthetic entry separately.
pub fn build_manifest(workspace_dir: &Path) -> Result<Vec<ManifestEntry>, ManifestError> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(workspace_dir).follow_links(false) {
        let entry = entry.map_err(|e| ManifestError::Io {
            path: workspace_dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(workspace_dir)
            .expect("walkdir yields children of the workspace");
        let name = posix_name(rel);
        if name == BUNDLE_NAME {
            continue;
        }
        entries.push(entry_for(path, &name)?);
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Build the manifest entry for one file with the given relative name.
pub fn entry_for(path: &Path, name: &str) -> Result<ManifestEntry, ManifestError> {
    let io_err = |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let metadata = fs::metadata(path).map_err(io_err)?;
    let modified_at = metadata
        .modified()
        .map(|mtime| {
            DateTime::<Local>::from(mtime).to_rfc3339_opts(SecondsFormat::Millis, false)
        })
        .unwrap_or_default();

    Ok(ManifestEntry {
        name: name.to_string(),
        size: metadata.len(),
        sha256: sha256_file(path)?,
        relative_url: encode_relative_url(name),
        modified_at,
    })
}

/// Create `_cfshare_bundle.zip` in the workspace containing every manifest
/// file at its workspace-relative path, and return the bundle's manifest
/// entry named `download.zip`.
pub fn write_zip_bundle(
    workspace_dir: &Path,
    entries: &[ManifestEntry],
) -> Result<ManifestEntry, ManifestError> {
    let bundle_path = workspace_dir.join(BUNDLE_NAME);
    let file = File::create(&bundle_path).map_err(|source| ManifestError::Io {
        path: bundle_path.clone(),
        source,
    })?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in entries {
        writer.start_file(entry.name.as_str(), options)?;
        let source_path = workspace_dir.join(&entry.name);
        let contents = fs::read(&source_path).map_err(|source| ManifestError::Io {
            path: source_path.clone(),
            source,
        })?;
        writer.write_all(&contents).map_err(|source| ManifestError::Io {
            path: bundle_path.clone(),
            source,
        })?;
    }
    writer.finish()?;

    let mut bundle_entry = entry_for(&bundle_path, BUNDLE_URL_NAME)?;
    bundle_entry.relative_url = format!("/{BUNDLE_URL_NAME}");
    Ok(bundle_entry)
}

/// Workspace-relative path with POSIX separators.
fn posix_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Percent-encode each path segment, preserving `/` separators.
fn encode_relative_url(name: &str) -> String {
    let encoded: Vec<String> = name
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("/{}", encoded.join("/"))
}

/// Streaming SHA-256 of a file, hex-encoded.
fn sha256_file(path: &Path) -> Result<String, ManifestError> {
    let io_err = |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

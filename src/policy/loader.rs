//! Policy loading and persistence.
//!
//! Layers, highest priority first:
//!
//! 1. On-disk `policy.json` (a patch object)
//! 2. Process-wide runtime patch (from the adapter's config)
//! 3. Built-in defaults
//!
//! Missing files are not errors. Invalid JSON is an error (fail fast).
//! Unknown keys and invalid enum values are dropped with warnings rather
//! than silently retained.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::PolicyError;
use super::ignore::IgnoreMatcher;
use super::schema::{sanitize_patch, Policy, PolicyPatch};

/// Filename of the policy patch under the state dir.
pub const POLICY_FILE: &str = "policy.json";

/// Filename of the extra ignore patterns under the state dir.
pub const POLICY_IGNORE_FILE: &str = "policy.ignore";

/// The result of a successful [`PolicyLoader::load`].
pub struct LoadedPolicy {
    /// The merged, clamped, validated policy.
    pub policy: Policy,
    /// Warnings produced while merging (unknown keys, invalid enums).
    pub warnings: Vec<String>,
    /// Compiled path-ignore matcher.
    pub matcher: IgnoreMatcher,
}

/// Loads and persists the policy for one state directory.
pub struct PolicyLoader {
    policy_path: PathBuf,
    ignore_path: PathBuf,
    runtime_patch: Option<serde_json::Value>,
    cwd: PathBuf,
}

impl PolicyLoader {
    /// Create a loader rooted at `state_dir`.
    ///
    /// `runtime_patch` is the process-wide config patch supplied by the
    /// adapter; it sits between the built-in defaults and the on-disk file.
    pub fn new(state_dir: &Path, runtime_patch: Option<serde_json::Value>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            policy_path: state_dir.join(POLICY_FILE),
            ignore_path: state_dir.join(POLICY_IGNORE_FILE),
            runtime_patch,
            cwd,
        }
    }

    /// Override the working directory used for `.gitignore` discovery.
    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = cwd;
        self
    }

    /// Load and merge all layers, compile the ignore matcher.
    pub fn load(&self) -> Result<LoadedPolicy, PolicyError> {
        let mut warnings = Vec::new();
        let mut policy = Policy::default();

        if let Some(patch) = &self.runtime_patch {
            let mut raw = patch.clone();
            sanitize_patch(&mut raw, "config", &mut warnings);
            let patch: PolicyPatch = serde_json::from_value(raw).map_err(|source| {
                PolicyError::Parse {
                    path: PathBuf::from("<runtime config>"),
                    source,
                }
            })?;
            policy.apply(patch);
            debug!("applied runtime policy patch");
        }

        if let Some(mut raw) = self.read_raw_optional()? {
            sanitize_patch(&mut raw, "policy.json", &mut warnings);
            let patch: PolicyPatch = serde_json::from_value(raw).map_err(|source| {
                PolicyError::Parse {
                    path: self.policy_path.clone(),
                    source,
                }
            })?;
            policy.apply(patch);
            debug!("applied on-disk policy patch from {:?}", self.policy_path);
        }

        policy.clamp();

        for warning in &warnings {
            warn!("{warning}");
        }

        let matcher = IgnoreMatcher::build(Some(&self.ignore_path), &self.cwd)?;

        Ok(LoadedPolicy {
            policy,
            warnings,
            matcher,
        })
    }

    /// Read the raw on-disk patch object (empty object if absent).
    pub fn read_raw(&self) -> Result<serde_json::Value, PolicyError> {
        Ok(self
            .read_raw_optional()?
            .unwrap_or_else(|| serde_json::json!({})))
    }

    fn read_raw_optional(&self) -> Result<Option<serde_json::Value>, PolicyError> {
        let contents = match fs::read_to_string(&self.policy_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PolicyError::Read {
                    path: self.policy_path.clone(),
                    source,
                })
            }
        };
        let value: serde_json::Value =
            serde_json::from_str(&contents).map_err(|source| PolicyError::Parse {
                path: self.policy_path.clone(),
                source,
            })?;
        if !value.is_object() {
            return Err(PolicyError::NotAnObject {
                path: self.policy_path.clone(),
            });
        }
        Ok(Some(value))
    }

    /// Deep-merge `patch` into the on-disk patch and write it back.
    ///
    /// Objects merge recursively; everything else (including lists) is
    /// replaced. The write goes through a temp file and an atomic rename.
    pub fn write_merged(&self, patch: &serde_json::Value) -> Result<(), PolicyError> {
        let mut on_disk = self.read_raw()?;
        deep_merge(&mut on_disk, patch);

        if let Some(parent) = self.policy_path.parent() {
            fs::create_dir_all(parent).map_err(|source| PolicyError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp_path = self.policy_path.with_extension("json.tmp");
        let pretty = serde_json::to_string_pretty(&on_disk).map_err(|source| {
            PolicyError::Parse {
                path: self.policy_path.clone(),
                source,
            }
        })?;
        fs::write(&tmp_path, pretty).map_err(|source| PolicyError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.policy_path).map_err(|source| PolicyError::Write {
            path: self.policy_path.clone(),
            source,
        })?;

        debug!("wrote merged policy to {:?}", self.policy_path);
        Ok(())
    }
}

/// Recursive object merge; non-objects replace.
fn deep_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::schema::{AccessMode, TunnelProtocol};
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let loader = PolicyLoader::new(dir.path(), None).with_cwd(dir.path().to_path_buf());
        let loaded = loader.load().unwrap();
        assert_eq!(loaded.policy, Policy::default());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_disk_overrides_runtime_patch() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(POLICY_FILE),
            r#"{"default_ttl_seconds": 900}"#,
        )
        .unwrap();
        let runtime = serde_json::json!({"default_ttl_seconds": 120, "max_ttl_seconds": 7200});
        let loader =
            PolicyLoader::new(dir.path(), Some(runtime)).with_cwd(dir.path().to_path_buf());
        let loaded = loader.load().unwrap();
        // Disk wins for the contested key; runtime survives elsewhere.
        assert_eq!(loaded.policy.default_ttl_seconds, 900);
        assert_eq!(loaded.policy.max_ttl_seconds, 7200);
    }

    #[test]
    fn test_invalid_enum_warns_and_keeps_default() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(POLICY_FILE),
            r#"{"default_expose_port_access": "open-sesame"}"#,
        )
        .unwrap();
        let loader = PolicyLoader::new(dir.path(), None).with_cwd(dir.path().to_path_buf());
        let loaded = loader.load().unwrap();
        assert_eq!(loaded.policy.default_expose_port_access, AccessMode::Token);
        assert_eq!(loaded.warnings.len(), 1);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(POLICY_FILE), "{not json").unwrap();
        let loader = PolicyLoader::new(dir.path(), None).with_cwd(dir.path().to_path_buf());
        assert!(matches!(loader.load(), Err(PolicyError::Parse { .. })));
    }

    #[test]
    fn test_write_merged_roundtrip() {
        let dir = tempdir().unwrap();
        let loader = PolicyLoader::new(dir.path(), None).with_cwd(dir.path().to_path_buf());

        loader
            .write_merged(&serde_json::json!({"tunnel": {"protocol": "quic"}}))
            .unwrap();
        loader
            .write_merged(&serde_json::json!({
                "tunnel": {"edge_ip_version": "4"},
                "blocked_ports": [8080]
            }))
            .unwrap();

        let loaded = loader.load().unwrap();
        // Nested objects merged deeply across the two writes.
        assert_eq!(loaded.policy.tunnel.protocol, TunnelProtocol::Quic);
        assert_eq!(
            loaded.policy.tunnel.edge_ip_version.as_arg(),
            "4"
        );
        // Lists replaced shallowly.
        assert_eq!(loaded.policy.blocked_ports.len(), 1);
        assert!(loaded.policy.blocked_ports.contains(&8080));
    }

    #[test]
    fn test_write_merged_replaces_lists() {
        let dir = tempdir().unwrap();
        let loader = PolicyLoader::new(dir.path(), None).with_cwd(dir.path().to_path_buf());
        loader
            .write_merged(&serde_json::json!({"blocked_ports": [1, 2, 3]}))
            .unwrap();
        loader
            .write_merged(&serde_json::json!({"blocked_ports": [9]}))
            .unwrap();
        let raw = loader.read_raw().unwrap();
        assert_eq!(raw["blocked_ports"], serde_json::json!([9]));
    }

    #[test]
    fn test_clamping_applied_after_merge() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(POLICY_FILE),
            r#"{"default_ttl_seconds": 5, "rate_limit": {"window_ms": 50}}"#,
        )
        .unwrap();
        let loader = PolicyLoader::new(dir.path(), None).with_cwd(dir.path().to_path_buf());
        let loaded = loader.load().unwrap();
        assert_eq!(loaded.policy.default_ttl_seconds, 60);
        assert_eq!(loaded.policy.rate_limit.window_ms, 1_000);
    }
}

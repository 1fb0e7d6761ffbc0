//! Path-ignore matching with `.gitignore` semantics.
//!
//! The matcher combines three pattern sources: built-in patterns (VCS
//! metadata and the tool's own state directories), the user's
//! `policy.ignore` file, and the current working directory's `.gitignore`.
//! A path is blocked if any of its relative-to-CWD form, its absolute form,
//! or its bare basename matches.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use super::error::PolicyError;

/// Patterns that are always in effect.
const BUILTIN_PATTERNS: &[&str] = &[
    ".git/",
    ".cfshare/",
    ".openclaw/",
    "_cfshare_bundle.zip",
];

/// Compiled ignore matcher.
pub struct IgnoreMatcher {
    gitignore: Gitignore,
    cwd: PathBuf,
}

impl IgnoreMatcher {
    /// Build the matcher from the built-ins, an optional `policy.ignore`
    /// file, and the CWD's `.gitignore` (when present).
    pub fn build(policy_ignore: Option<&Path>, cwd: &Path) -> Result<Self, PolicyError> {
        // Root the matcher at the filesystem root so absolute candidate
        // paths stay inside the matcher's scope.
        let mut builder = GitignoreBuilder::new("/");

        for pattern in BUILTIN_PATTERNS {
            builder.add_line(None, pattern)?;
        }

        if let Some(path) = policy_ignore {
            if path.is_file() {
                if let Some(err) = builder.add(path) {
                    return Err(PolicyError::IgnorePattern(err));
                }
                debug!("loaded ignore patterns from {:?}", path);
            }
        }

        let cwd_gitignore = cwd.join(".gitignore");
        if cwd_gitignore.is_file() {
            if let Some(err) = builder.add(&cwd_gitignore) {
                return Err(PolicyError::IgnorePattern(err));
            }
            debug!("loaded ignore patterns from {:?}", cwd_gitignore);
        }

        Ok(Self {
            gitignore: builder.build()?,
            cwd: cwd.to_path_buf(),
        })
    }

    /// An empty matcher that blocks only the built-in patterns.
    pub fn builtin_only() -> Self {
        let mut builder = GitignoreBuilder::new("/");
        for pattern in BUILTIN_PATTERNS {
            // Built-in patterns are static and known-valid.
            let _ = builder.add_line(None, pattern);
        }
        Self {
            gitignore: builder.build().expect("builtin ignore patterns compile"),
            cwd: PathBuf::from("/"),
        }
    }

    /// True if `path` is blocked by any pattern source.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let mut candidates: Vec<PathBuf> = Vec::with_capacity(3);

        if let Ok(rel) = path.strip_prefix(&self.cwd) {
            candidates.push(PathBuf::from("/").join(rel));
        }
        candidates.push(path.to_path_buf());
        if let Some(name) = path.file_name() {
            candidates.push(PathBuf::from("/").join(name));
        }

        candidates.into_iter().any(|candidate| {
            self.gitignore
                .matched_path_or_any_parents(&candidate, is_dir)
                .is_ignore()
        })
    }
}

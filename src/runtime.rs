//! Process-wide runtime configuration.
//!
//! The adapter constructs one [`RuntimeConfig`] per process and threads it
//! through the manager. It fixes the state directory layout, the tunnel
//! agent override, and the knobs tests use to tighten timing.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Which front-end owns this process; decides the default state dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Standalone CLI: state under `~/.cfshare`.
    #[default]
    Cli,
    /// Plugin host: state under `~/.openclaw/cfshare`.
    Plugin,
}

/// Overrides accepted from the adapter's `--config` JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ConfigOverrides {
    /// State directory override.
    pub state_dir: Option<PathBuf>,
    /// Tunnel agent binary override.
    pub agent_path: Option<PathBuf>,
    /// Adapter mode.
    pub mode: Option<AdapterMode>,
    /// Process-wide policy patch (merged below `policy.json`).
    pub policy: Option<serde_json::Value>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of all persisted state.
    pub state_dir: PathBuf,
    /// Adapter mode.
    pub mode: AdapterMode,
    /// Tunnel agent binary override; PATH lookup otherwise.
    pub agent_path: Option<PathBuf>,
    /// Process-wide policy patch.
    pub policy_patch: Option<serde_json::Value>,
    /// Reaper tick interval.
    pub reaper_interval: Duration,
    /// Tunnel spawn attempts.
    pub tunnel_attempts: u32,
    /// Tunnel readiness timeout.
    pub ready_timeout: Duration,
}

impl RuntimeConfig {
    /// Configuration with the default state dir for `mode`.
    pub fn for_mode(mode: AdapterMode) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let state_dir = match mode {
            AdapterMode::Cli => home.join(".cfshare"),
            AdapterMode::Plugin => home.join(".openclaw").join("cfshare"),
        };
        Self {
            state_dir,
            mode,
            agent_path: None,
            policy_patch: None,
            reaper_interval: Duration::from_secs(30),
            tunnel_attempts: crate::tunnel::DEFAULT_ATTEMPTS,
            ready_timeout: crate::tunnel::READY_TIMEOUT,
        }
    }

    /// Apply adapter overrides.
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(mode) = overrides.mode {
            self = Self::for_mode(mode);
        }
        if let Some(state_dir) = overrides.state_dir {
            self.state_dir = state_dir;
        }
        self.agent_path = overrides.agent_path.or(self.agent_path);
        self.policy_patch = overrides.policy.or(self.policy_patch);
        self
    }

    /// Root of the per-session workspaces.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::for_mode(AdapterMode::Cli)
    }
}

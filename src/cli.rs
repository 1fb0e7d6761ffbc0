//! Command-line interface definitions.
//!
//! Uses clap's derive API. The CLI is a thin adapter: a positional tool
//! name selects an operation, `--params` supplies its JSON input, and the
//! result is printed as JSON on stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Ephemeral public HTTPS exposure for local ports and files.
///
/// cfshare publishes a local TCP service or a set of files through an
/// external quick-tunnel agent, bounded by a TTL, access control, and an
/// audit trail.
#[derive(Parser, Debug)]
#[command(name = "cfshare")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand (internal use only).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Operation to run: env_check, expose_port, expose_files, list, get,
    /// stop, logs, maintenance, audit_query, audit_export.
    pub tool: Option<String>,

    /// Operation parameters as inline JSON.
    #[arg(long = "params", value_name = "JSON")]
    pub params: Option<String>,

    /// Operation parameters from a JSON file.
    #[arg(long = "params-file", value_name = "PATH", conflicts_with = "params")]
    pub params_file: Option<PathBuf>,

    /// Runtime config overrides as inline JSON
    /// (state_dir, agent_path, mode, policy).
    #[arg(long = "config", value_name = "JSON")]
    pub config: Option<String>,

    /// Runtime config overrides from a JSON file.
    #[arg(long = "config-file", value_name = "PATH", conflicts_with = "config")]
    pub config_file: Option<PathBuf>,

    /// Working-directory hint; relative input paths resolve against it.
    #[arg(long = "workspace-dir", value_name = "PATH")]
    pub workspace_dir: Option<PathBuf>,

    /// Background expose operations via a detached worker (default).
    #[arg(long = "keep-alive", overrides_with = "no_keep_alive")]
    pub keep_alive: bool,

    /// Run expose operations in the foreground until the session ends.
    #[arg(long = "no-keep-alive")]
    pub no_keep_alive: bool,

    /// Print compact JSON instead of pretty-printed.
    #[arg(long = "compact")]
    pub compact: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Hidden subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Detached worker that owns a backgrounded exposure (hidden).
    ///
    /// Spawned by expose operations in keep-alive mode; reads its inputs
    /// from the handoff file and writes the result next to it.
    #[command(name = "internal-worker", hide = true)]
    InternalWorker {
        /// Path to the handoff file.
        #[arg(long = "handoff", required = true)]
        handoff: PathBuf,
    },
}

impl Cli {
    /// Whether expose operations should detach into a worker.
    pub fn effective_keep_alive(&self) -> bool {
        !self.no_keep_alive
    }
}

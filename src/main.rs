//! cfshare binary: the CLI adapter over the exposure manager.
//!
//! The binary parses one operation, feeds it JSON parameters, and prints
//! the JSON result on stdout (diagnostics go to stderr). Expose operations
//! background themselves by default: the parent writes a handoff file,
//! spawns a detached `internal-worker` that owns the session for its
//! lifetime, and waits for the worker to report the result.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cfshare::audit::AuditFilter;
use cfshare::cli::{Cli, Commands};
use cfshare::runtime::{ConfigOverrides, RuntimeConfig};
use cfshare::session::{
    ExposeError, ExposeFilesParams, ExposePortParams, ExposureManager, GetParams, LogsParams,
    StopParams,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// How long the parent waits for a detached worker's result.
const HANDOFF_WAIT: Duration = Duration::from_secs(45);

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    if let Some(Commands::InternalWorker { handoff }) = cli.command {
        return run_worker(&handoff);
    }

    let tool = cli
        .tool
        .clone()
        .ok_or_else(|| anyhow::anyhow!("an operation is required; see cfshare --help"))?;
    let params = read_params(&cli)?;
    let overrides = read_overrides(&cli)?;

    if let Some(dir) = &cli.workspace_dir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("cannot enter workspace dir {dir:?}"))?;
    }

    let is_expose = matches!(tool.as_str(), "expose_port" | "expose_files");
    if is_expose && cli.effective_keep_alive() {
        let result = run_detached(&tool, &params, &overrides)?;
        emit(&result, cli.compact);
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async {
        let runtime = RuntimeConfig::default().with_overrides(parse_overrides(&overrides)?);
        let manager = ExposureManager::new(runtime).map_err(op_error)?;

        let result = dispatch(&manager, &tool, params).await.map_err(op_error)?;
        emit(&result, cli.compact);

        // Foreground expose: keep serving until the session ends or the
        // user interrupts.
        if is_expose {
            info!("serving in the foreground; Ctrl-C stops the exposure");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {
                        if !manager.has_live_sessions() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted, stopping sessions");
                        let _ = manager
                            .stop(StopParams { id: Some("all".into()), ids: None })
                            .await;
                        break;
                    }
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    })
}

/// Execute one operation against a manager.
async fn dispatch(
    manager: &ExposureManager,
    tool: &str,
    params: Value,
) -> Result<Value, ExposeError> {
    match tool {
        "env_check" => Ok(manager.env_check()),
        "expose_port" => {
            let params: ExposePortParams = parse_params(params)?;
            manager.expose_port(params).await
        }
        "expose_files" => {
            let params: ExposeFilesParams = parse_params(params)?;
            manager.expose_files(params).await
        }
        "list" => Ok(manager.list()),
        "get" => {
            let params: GetParams = parse_params(params)?;
            manager.get(params).await
        }
        "stop" => {
            let params: StopParams = parse_params(params)?;
            manager.stop(params).await
        }
        "logs" => {
            let params: LogsParams = parse_params(params)?;
            manager.logs(params)
        }
        "maintenance" => {
            let params: MaintenanceParams = parse_params(params)?;
            match params.action.as_str() {
                "run_gc" => Ok(manager.run_gc().await),
                "policy_show" => Ok(manager.policy_show()),
                "policy_update" => {
                    let patch = params.patch.ok_or_else(|| {
                        ExposeError::InvalidInput("policy_update requires 'patch'".into())
                    })?;
                    manager.policy_update(patch)
                }
                other => Err(ExposeError::InvalidInput(format!(
                    "unknown maintenance action: {other}"
                ))),
            }
        }
        "audit_query" => {
            let filter: AuditFilter = parse_params(params)?;
            Ok(manager.audit_query(filter))
        }
        "audit_export" => {
            let params: AuditExportParams = parse_params(params)?;
            manager.audit_export(params.filter, params.output_path)
        }
        other => Err(ExposeError::InvalidInput(format!(
            "unknown operation: {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct MaintenanceParams {
    action: String,
    #[serde(default)]
    patch: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditExportParams {
    #[serde(flatten)]
    filter: AuditFilter,
    #[serde(default)]
    output_path: Option<PathBuf>,
}

/// The handoff payload written for a detached worker.
#[derive(Debug, Deserialize, serde::Serialize)]
struct Handoff {
    tool: String,
    params: Value,
    config: Value,
}

/// Background an expose operation: write the handoff, spawn the worker,
/// wait for its result file.
fn run_detached(tool: &str, params: &Value, overrides: &Value) -> Result<Value> {
    let runtime = RuntimeConfig::default().with_overrides(parse_overrides(overrides)?);
    let handoff_dir = runtime.state_dir.join("handoffs");
    fs::create_dir_all(&handoff_dir).context("cannot create handoff dir")?;

    let stamp = chrono::Local::now().timestamp_millis().max(0) as u64;
    let handoff_path = handoff_dir.join(format!(
        "handoff-{}-{}.json",
        cfshare::netutil::base36_ms(stamp),
        std::process::id()
    ));
    let handoff = Handoff {
        tool: tool.to_string(),
        params: params.clone(),
        config: overrides.clone(),
    };
    fs::write(&handoff_path, serde_json::to_vec_pretty(&handoff)?)
        .context("cannot write handoff file")?;

    let exe = std::env::current_exe().context("cannot resolve current executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("internal-worker")
        .arg("--handoff")
        .arg(&handoff_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let child = command.spawn().context("failed to spawn worker")?;
    debug!("spawned detached worker pid {}", child.id());

    let result_path = result_path_for(&handoff_path);
    let deadline = std::time::Instant::now() + HANDOFF_WAIT;
    while std::time::Instant::now() < deadline {
        if let Ok(contents) = fs::read_to_string(&result_path) {
            if let Ok(value) = serde_json::from_str::<Value>(&contents) {
                let _ = fs::remove_file(&handoff_path);
                if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                    let message = value
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or(error);
                    anyhow::bail!("{message}");
                }
                return Ok(value);
            }
        }
        std::thread::sleep(Duration::from_millis(150));
    }
    anyhow::bail!("worker did not report a result within {HANDOFF_WAIT:?}")
}

/// Worker entry: run the expose, report through the result file, stay
/// alive until the session reaches a terminal state.
fn run_worker(handoff_path: &Path) -> Result<()> {
    let contents = fs::read_to_string(handoff_path)
        .with_context(|| format!("cannot read handoff {handoff_path:?}"))?;
    let handoff: Handoff = serde_json::from_str(&contents).context("malformed handoff file")?;
    let result_path = result_path_for(handoff_path);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async {
        let runtime = RuntimeConfig::default().with_overrides(parse_overrides(&handoff.config)?);
        let manager = match ExposureManager::new(runtime) {
            Ok(manager) => manager,
            Err(e) => {
                write_result(&result_path, &error_value(&e));
                return Err(anyhow::anyhow!(e));
            }
        };

        match dispatch(&manager, &handoff.tool, handoff.params).await {
            Ok(result) => {
                write_result(&result_path, &result);
                // Own the session until it terminates.
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    if !manager.has_live_sessions() {
                        break;
                    }
                }
                info!("worker exiting; no live sessions remain");
                Ok(())
            }
            Err(e) => {
                write_result(&result_path, &error_value(&e));
                Err(anyhow::anyhow!(e))
            }
        }
    })
}

fn result_path_for(handoff_path: &Path) -> PathBuf {
    let mut name = handoff_path.as_os_str().to_os_string();
    name.push(".result");
    PathBuf::from(name)
}

fn write_result(path: &Path, value: &Value) {
    let tmp = path.with_extension("result.tmp");
    let payload = serde_json::to_vec_pretty(value).unwrap_or_else(|_| b"{}".to_vec());
    if fs::write(&tmp, payload).and_then(|()| fs::rename(&tmp, path)).is_err() {
        warn!("failed to write worker result to {path:?}");
    }
}

fn error_value(e: &ExposeError) -> Value {
    json!({"error": e.kind(), "message": e.to_string()})
}

fn op_error(e: ExposeError) -> anyhow::Error {
    anyhow::anyhow!(e)
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ExposeError> {
    serde_json::from_value(params).map_err(|e| ExposeError::InvalidInput(e.to_string()))
}

fn read_params(cli: &Cli) -> Result<Value> {
    let raw = match (&cli.params, &cli.params_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("cannot read params file {path:?}"))?
        }
        (None, None) => return Ok(json!({})),
    };
    serde_json::from_str(&raw).context("params are not valid JSON")
}

fn read_overrides(cli: &Cli) -> Result<Value> {
    let raw = match (&cli.config, &cli.config_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("cannot read config file {path:?}"))?
        }
        (None, None) => return Ok(json!({})),
    };
    serde_json::from_str(&raw).context("config is not valid JSON")
}

fn parse_overrides(value: &Value) -> Result<ConfigOverrides> {
    serde_json::from_value(value.clone()).context("invalid config overrides")
}

fn emit(result: &Value, compact: bool) {
    let rendered = if compact {
        serde_json::to_string(result)
    } else {
        serde_json::to_string_pretty(result)
    };
    match rendered {
        Ok(out) => println!("{out}"),
        Err(e) => eprintln!("failed to render result: {e}"),
    }
}

/// Initialize the tracing subscriber on stderr.
///
/// # Verbosity levels
/// - 0 (default): warnings and errors
/// - 1 (-v): info
/// - 2 (-vv): debug
/// - 3+ (-vvv): trace
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    Ok(())
}

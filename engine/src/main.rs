use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_core::{resolve_state_dir, ConfigStore, StatePaths};
use tether_observability::{emit, init_engine_logging, logs_dir_for, Lifecycle, LifecycleRecord};
use tether_runtime::ProcessExecutor;
use tether_server::{serve, AppState};
use tether_subagents::{SubagentPaths, SubagentStore};
use tether_types::SessionKey;
use tracing::info;
use uuid::Uuid;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "tether-engine")]
#[command(about = "Headless run orchestrator with replayable event streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// Executor command line, e.g. `my-agent --jsonl`.
        #[arg(long, env = "TETHER_EXECUTOR")]
        executor: Option<String>,
    },
    /// Prints persistent subagent entries as JSON.
    Subagents {
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        requester: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            executor,
        } => {
            let paths = StatePaths::new(resolve_state_dir(state_dir));
            let logs_dir = logs_dir_for(&paths.state_dir);
            let (_log_guard, log_info) = init_engine_logging(&logs_dir, LOG_RETENTION_DAYS)?;
            emit(
                tracing::Level::INFO,
                LifecycleRecord::new(Lifecycle::LoggingInitialized)
                    .status("ok")
                    .detail(format!("removed {} expired log files", log_info.removed_files)),
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| paths.config_path.clone());
            let startup_attempt_id = Uuid::new_v4().to_string();
            log_startup_paths(&paths, &config_path, &addr, &startup_attempt_id);

            let config_store = ConfigStore::new(&config_path, build_cli_overrides(executor))
                .await
                .with_context(|| format!("failed to load config {}", config_path.display()))?;
            let effective = config_store.get().await;
            let process = ProcessExecutor::from_config(&effective.executor).context(
                "set executor.command in config.json, TETHER_EXECUTOR_COMMAND or --executor",
            )?;
            info!(program = process.program(), "executor configured");
            let state = AppState::from_paths(&paths, config_store, Arc::new(process)).await;
            serve(addr, state).await?;
        }
        Command::Subagents {
            state_dir,
            requester,
        } => {
            let paths = StatePaths::new(resolve_state_dir(state_dir));
            let store = SubagentStore::new(SubagentPaths::new(&paths.subagents_dir));
            let records = match requester {
                Some(raw) => {
                    let requester = SessionKey::parse(&raw)
                        .with_context(|| format!("invalid requester key `{raw}`"))?;
                    store.list_by_requester(&requester).await?
                }
                None => store.list().await?,
            };
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

/// `--executor "prog a b"` becomes `{"executor": {"command": "prog", "args": ["a", "b"]}}`.
fn build_cli_overrides(executor: Option<String>) -> Option<serde_json::Value> {
    let raw = executor?;
    let mut parts = raw.split_whitespace().map(str::to_string);
    let command = parts.next()?;
    Some(serde_json::json!({
        "executor": {
            "command": command,
            "args": parts.collect::<Vec<_>>(),
        }
    }))
}

fn log_startup_paths(paths: &StatePaths, config_path: &Path, addr: &SocketAddr, attempt_id: &str) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting tether-engine on http://{addr}");
    info!(
        "startup paths: attempt_id={} exe={} cwd={} state_dir={} config_path={}",
        attempt_id,
        exe.display(),
        cwd.display(),
        paths.state_dir.display(),
        config_path.display()
    );
}

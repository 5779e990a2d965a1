//! ttyhub: PTY session hub and terminal forwarder.
//!
//! Without flags, wraps a command (default: `$SHELL`) in a managed,
//! recorded session mirrored on the current terminal. Maintenance flags
//! list, kill, and clean up sessions in the control directory.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use ttyhub_server::forwarder::{run_forwarder, ForwarderOptions};
use ttyhub_server::manager::SessionManager;
use ttyhub_server::Config;

/// ttyhub: PTY session hub
#[derive(Parser, Debug)]
#[command(name = "ttyhub", version, about = "PTY session hub and terminal forwarder")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.ttyhub/config.toml")]
    config: String,

    /// Control directory holding session state
    #[arg(long)]
    control_dir: Option<String>,

    /// Title mode (none, filter, static, dynamic)
    #[arg(long)]
    title_mode: Option<String>,

    /// Session display name
    #[arg(long)]
    name: Option<String>,

    /// Working directory for the session
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// List known sessions as JSON and exit
    #[arg(long)]
    list_sessions: bool,

    /// Kill the given session and exit
    #[arg(long, value_name = "ID")]
    kill_session: Option<String>,

    /// Remove all exited sessions and exit
    #[arg(long)]
    cleanup: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Command to run in the session (defaults to $SHELL)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match Config::load(
        Some(Path::new(&cli.config)),
        cli.control_dir.as_deref(),
        cli.title_mode.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let manager = match SessionManager::new(config) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "failed to open control directory");
            std::process::exit(1);
        }
    };

    if cli.list_sessions {
        let sessions = manager.list_sessions();
        match serde_json::to_string_pretty(&sessions) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!(error = %e, "cannot serialize session list");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Some(id) = cli.kill_session {
        if let Err(e) = manager.kill_session(&id, None).await {
            error!(session_id = %id, error = %e, "kill failed");
            std::process::exit(1);
        }
        info!(session_id = %id, "session killed");
        return;
    }

    if cli.cleanup {
        let removed = manager.cleanup_exited();
        println!("removed {} exited session(s)", removed.len());
        return;
    }

    let command = if cli.command.is_empty() {
        vec![std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string())]
    } else {
        cli.command
    };

    let options = ForwarderOptions {
        name: cli.name,
        cwd: cli.cwd,
        title_mode: None,
    };
    match run_forwarder(Arc::clone(&manager), command, options).await {
        Ok(exit_code) => {
            manager.shutdown().await;
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!(error = %e, "forwarder failed");
            manager.shutdown().await;
            std::process::exit(1);
        }
    }
}

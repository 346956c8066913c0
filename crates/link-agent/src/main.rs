//! Handset link agent
//!
//! Keeps this device connected to its control server, executes the server's
//! telephony commands through an actuator hook, and reports call state that
//! the local telephony stack writes to stdin.

mod actuator;
mod config;
mod logging;
mod observer;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use handset_link_core::{EngineExit, LinkEngineBuilder};
use tokio::io::BufReader;
use tracing::{error, info, warn};

use crate::actuator::HookActuator;
use crate::config::{default_config_path, AgentConfig};
use crate::logging::init_tracing;
use crate::telemetry::SysfsTelemetry;

#[derive(Parser, Debug)]
#[command(name = "handset-link", author, version, about = "Keep a handset linked to its control server")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, env = "HANDSET_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Server address: host, http(s):// or ws(s):// URL
    #[arg(long, env = "HANDSET_LINK_SERVER_URL")]
    server_url: Option<String>,

    /// Device id issued during pairing
    #[arg(long, env = "HANDSET_LINK_DEVICE_ID")]
    device_id: Option<String>,

    /// Bearer token sent in the handshake
    #[arg(long, env = "HANDSET_LINK_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// `WEBSOCKET`, or `REST_API` to poll the device API over HTTP
    #[arg(long, env = "HANDSET_LINK_CONNECTION_MODE")]
    connection_mode: Option<String>,

    /// Do not reconnect after the link drops
    #[arg(long)]
    no_auto_reconnect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HANDSET_LINK_LOG")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent (default)
    Run,
    /// Print the effective configuration and exit
    PrintConfig,
}

impl Cli {
    /// File configuration with command-line overrides applied
    fn effective_config(&self) -> Result<AgentConfig> {
        let mut config = match self.config.clone().or_else(default_config_path) {
            Some(path) => AgentConfig::load(&path)?,
            None => AgentConfig::default(),
        };

        if let Some(url) = &self.server_url {
            config.link.server_url = Some(url.clone());
        }
        if let Some(device_id) = &self.device_id {
            config.link.device_id = Some(device_id.clone());
        }
        if let Some(token) = &self.auth_token {
            config.link.auth_token = Some(token.clone());
        }
        if let Some(mode) = &self.connection_mode {
            config.link.connection_mode = mode.clone();
        }
        if self.no_auto_reconnect {
            config.link.auto_reconnect = false;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if self.json_logs {
            config.log.json = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.effective_config()?;

    if let Some(Command::PrintConfig) = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(&config.log)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting handset-link");

    match run(config).await? {
        EngineExit::Shutdown => {
            info!("Agent stopped");
            Ok(())
        }
        EngineExit::Restart => restart(),
    }
}

async fn run(config: AgentConfig) -> Result<EngineExit> {
    let (engine, handle) = LinkEngineBuilder::new(config.link)
        .telemetry(Arc::new(SysfsTelemetry::new(&config.telemetry)))
        .actuator(Arc::new(HookActuator::new(config.actuator.hook.clone(), config.actuator.timeout())))
        .build()
        .context("cannot build link engine")?;
    let mut engine = tokio::spawn(engine.run());

    handle.connect().await?;

    let observer_handle = handle.clone();
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = observer::run_observer(stdin, observer_handle).await {
            warn!(error = %e, "Telephony observer failed");
        }
    });

    tokio::select! {
        exit = &mut engine => return exit.context("engine task failed"),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Cannot listen for interrupt");
            }
            info!("Interrupted, shutting down");
        }
    }

    // The engine may already be gone; either way the task result decides
    let _ = handle.disconnect().await;
    let _ = handle.shutdown().await;
    engine.await.context("engine task failed")
}

/// Replace this process with a fresh copy using the same arguments
fn restart() -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate agent executable")?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    info!(exe = %exe.display(), "Restarting agent");
    relaunch(std::process::Command::new(&exe).args(&args))
}

#[cfg(unix)]
fn relaunch(command: &mut std::process::Command) -> Result<()> {
    use std::os::unix::process::CommandExt;
    // exec only returns on failure
    Err(command.exec()).context("cannot re-exec agent")
}

#[cfg(not(unix))]
fn relaunch(command: &mut std::process::Command) -> Result<()> {
    command.spawn().context("cannot relaunch agent")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "[link]\nserver_url = \"old.example.com\"\ndevice_id = \"DEV1\"\n\n[log]\nlevel = \"warn\"\n"
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "handset-link",
            "--config",
            file.path().to_str().unwrap(),
            "--server-url",
            "new.example.com",
            "--no-auto-reconnect",
            "--connection-mode",
            "REST_API",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let config = cli.effective_config().unwrap();

        assert_eq!(config.link.server_url.as_deref(), Some("new.example.com"));
        assert_eq!(config.link.device_id.as_deref(), Some("DEV1"));
        assert!(!config.link.auto_reconnect);
        assert!(config.link.is_rest_mode());
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_print_config_subcommand() {
        let cli = Cli::try_parse_from(["handset-link", "print-config"]).unwrap();
        assert!(matches!(cli.command, Some(Command::PrintConfig)));
    }
}

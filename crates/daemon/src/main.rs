//! FunnyShell Daemon
//!
//! Serves one shared shell to every browser that connects.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config, DaemonConfig};
use daemon::orchestrator::DaemonOrchestrator;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// FunnyShell - one shell, shared by everyone in the room.
#[derive(Parser, Debug)]
#[command(name = "funnyshell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Port to listen on, overriding the configuration
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Start the shared shell and serve it
    Serve,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Serve => {
            config.validate()?;
            let _guard = init_tracing(&config.daemon, cli.verbose)?;
            tracing::info!("FunnyShell daemon starting...");
            run(config).await
        }
    }
}

/// Loads the configuration file and applies environment and CLI overrides.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&path)?;
    config.apply_env_overrides();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

/// Initializes tracing. `RUST_LOG` wins over the configured level.
///
/// The returned guard must live as long as the process when logging to a
/// file, or buffered lines are lost.
fn init_tracing(config: &DaemonConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .with_context(|| format!("log_file is not a file path: {}", path.display()))?;
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Runs the daemon until a shutdown signal arrives or the shell exits.
async fn run(config: Config) -> anyhow::Result<()> {
    let exit_on_shell_exit = config.shell.exit_on_shell_exit;
    let mut orchestrator = DaemonOrchestrator::new(config);

    let addr = orchestrator.start().await?;
    tracing::info!("FunnyShell listening on http://{}", addr);

    let shell_exit = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal.context("Failed to install signal handlers")?;
            None
        }
        exit = orchestrator.wait_for_shell_exit() => Some(exit),
    };

    if let Some(exit) = shell_exit {
        if exit_on_shell_exit {
            orchestrator.stop().await?;
            anyhow::bail!("Shell exited ({:?}), shutting down", exit);
        }

        tracing::warn!(
            reason = ?exit,
            "Shell exited; session stays up without a shell until shutdown"
        );
        wait_for_shutdown_signal()
            .await
            .context("Failed to install signal handlers")?;
    }

    tracing::info!("Received shutdown signal");
    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}

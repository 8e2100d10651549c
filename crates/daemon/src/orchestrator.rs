//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that starts the shell, the
//! input writer, the hub, the output reader and the HTTP server in order, and
//! tears them down again on shutdown.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::hub::{Hub, HubHandle};
use crate::server::{self, create_router, AppState};
use crate::session::{InputWriter, OutputReader, PtySession, PtyTerminal, ReaderExit, SessionStatus};

/// Gap before each startup command, so the shell has drawn its prompt.
const STARTUP_COMMAND_GAP: Duration = Duration::from_millis(200);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Tearing components down.
    ShuttingDown,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: OrchestratorState,
    /// The shared shell.
    shell: Option<Arc<PtySession>>,
    /// Handle to the hub.
    hub: Option<HubHandle>,
    /// Cleared when the shell's output stream ends.
    shell_running: Arc<AtomicBool>,
    /// Output reader; finishes when the shell goes away.
    reader_task: Option<JoinHandle<ReaderExit>>,
    /// Address the HTTP server is bound to.
    local_addr: Option<SocketAddr>,
    /// Cancellation token for background tasks.
    shutdown_token: CancellationToken,
    /// Background tasks aborted on stop.
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: OrchestratorState::Stopped,
            shell: None,
            hub: None,
            shell_running: Arc::new(AtomicBool::new(false)),
            reader_task: None,
            local_addr: None,
            shutdown_token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Returns the bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns a handle to the hub once started.
    pub fn hub(&self) -> Option<HubHandle> {
        self.hub.clone()
    }

    /// Returns whether the shell's output stream is still open.
    pub fn shell_running(&self) -> bool {
        self.shell_running.load(Ordering::Acquire)
    }

    /// Starts every component and returns the address being served.
    ///
    /// Failing to bind or to spawn the shell is fatal.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state != OrchestratorState::Stopped {
            anyhow::bail!("Orchestrator is already running");
        }
        self.state = OrchestratorState::Starting;

        info!("Starting FunnyShell daemon...");

        let listener = match server::bind(&self.config.server.addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state = OrchestratorState::Stopped;
                return Err(e.into());
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state = OrchestratorState::Stopped;
                return Err(e).context("Failed to read bound address");
            }
        };

        let shell = match PtySession::start(&self.config.shell) {
            Ok(shell) => Arc::new(shell),
            Err(e) => {
                self.state = OrchestratorState::Stopped;
                return Err(e).context("Failed to start shell");
            }
        };

        let (reader, writer) = match open_shell_streams(&shell) {
            Ok(streams) => streams,
            Err(e) => {
                self.state = OrchestratorState::Stopped;
                return Err(e);
            }
        };
        self.shell = Some(Arc::clone(&shell));

        // The writer task ends on its own once the hub drops the terminal.
        let (input, _writer_task) = InputWriter::spawn(writer);
        let terminal = Arc::new(PtyTerminal::new(Arc::clone(&shell), input));

        let (hub, handle) = Hub::new(terminal, self.config.hub.clone());
        self.tasks.push(tokio::spawn(hub.run()));
        debug!("Started hub");

        self.shell_running.store(true, Ordering::Release);
        self.reader_task = Some(OutputReader::spawn(reader, handle.clone()));
        debug!("Started output reader");

        if !self.config.shell.startup_commands.is_empty() {
            self.tasks.push(spawn_startup_commands(
                handle.clone(),
                self.config.shell.startup_commands.clone(),
                self.shutdown_token.clone(),
            ));
        }

        let state = AppState {
            hub: handle.clone(),
            client: self.config.client.clone(),
            queue_capacity: self.config.hub.client_queue_capacity,
            shell_running: Arc::clone(&self.shell_running),
        };
        let router = create_router(state, &self.config.server.web_dir);
        let token = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::select! {
                result = server::serve(listener, router) => {
                    if let Err(e) = result {
                        error!(error = %e, "HTTP server stopped");
                    }
                }
                _ = token.cancelled() => debug!("HTTP server stopping"),
            }
        }));

        self.hub = Some(handle);
        self.local_addr = Some(local_addr);
        self.state = OrchestratorState::Running;

        info!(addr = %local_addr, "Daemon orchestrator started");
        Ok(local_addr)
    }

    /// Resolves once the shell's output stream has ended.
    ///
    /// Pends forever if the daemon was never started.
    pub async fn wait_for_shell_exit(&mut self) -> ReaderExit {
        let Some(task) = self.reader_task.as_mut() else {
            return std::future::pending().await;
        };

        let exit = match task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(error = %e, "Output reader task failed");
                ReaderExit::EndOfStream
            }
        };
        self.reader_task = None;
        self.shell_running.store(false, Ordering::Release);

        match self.shell.as_ref().map(|shell| shell.try_wait()) {
            Some(Ok(SessionStatus::Exited(code))) => info!(code, "Shell exited"),
            Some(Ok(SessionStatus::Running)) => info!("Shell closed its terminal"),
            Some(Err(e)) => warn!(error = %e, "Failed to read shell exit status"),
            None => {}
        }

        exit
    }

    /// Stops everything. Connected clients are dropped without a drain.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            OrchestratorState::Stopped => return Ok(()),
            OrchestratorState::ShuttingDown => {
                anyhow::bail!("Orchestrator is already shutting down")
            }
            _ => {}
        }
        self.state = OrchestratorState::ShuttingDown;

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(shell) = self.shell.take() {
            let result = tokio::task::spawn_blocking(move || shell.kill())
                .await
                .context("Shell kill task failed")?;
            match result {
                Ok(status) => debug!(status = ?status, "Shell stopped"),
                Err(e) => warn!(error = %e, "Error killing shell"),
            }
        }

        self.hub = None;
        self.shell_running.store(false, Ordering::Release);
        self.state = OrchestratorState::Stopped;

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

/// Hands out the shell's output and input streams.
///
/// The shell is killed if either cannot be opened, so a failed start leaves
/// no process behind.
fn open_shell_streams(
    shell: &PtySession,
) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
    let streams = shell
        .reader()
        .context("Failed to open shell output")
        .and_then(|reader| {
            let writer = shell.take_writer().context("Failed to open shell input")?;
            Ok((reader, writer))
        });

    if streams.is_err() {
        if let Err(e) = shell.kill() {
            warn!(error = %e, "Error killing shell");
        }
    }
    streams
}

/// Types the configured startup commands into the shell through the hub.
fn spawn_startup_commands(
    hub: HubHandle,
    commands: Vec<String>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for command in commands {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(STARTUP_COMMAND_GAP) => {}
            }
            if hub.input(format!("{}\n", command)).await.is_err() {
                return;
            }
        }
        debug!("Startup commands sent");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.web_dir = temp_dir.path().to_path_buf();
        config.shell = ShellConfig {
            program: "/bin/sh".to_string(),
            args: vec![],
            startup_commands: vec![],
            ..ShellConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir));

        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
        assert!(orchestrator.hub().is_none());
        assert!(!orchestrator.shell_running());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir));

        let addr = orchestrator.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        assert!(orchestrator.shell_running());
        assert_eq!(orchestrator.hub().unwrap().client_count(), 0);

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir));

        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir));
        assert!(orchestrator.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.shell.program = "/nonexistent/shell".to_string();

        let mut orchestrator = DaemonOrchestrator::new(config);
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    }

    #[test]
    fn test_stream_failure_kills_shell() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let shell = PtySession::start(&config.shell).unwrap();
        let _writer = shell.take_writer().unwrap();

        let err = open_shell_streams(&shell).err().unwrap();
        assert!(err.to_string().contains("Failed to open shell input"));
        assert!(matches!(shell.try_wait().unwrap(), SessionStatus::Exited(_)));
    }

    #[tokio::test]
    async fn test_shell_exit_is_observed() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.shell.startup_commands = vec!["exit 3".to_string()];

        let mut orchestrator = DaemonOrchestrator::new(config);
        orchestrator.start().await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_for_shell_exit())
            .await
            .expect("shell did not exit");
        assert_eq!(exit, ReaderExit::EndOfStream);
        assert!(!orchestrator.shell_running());

        orchestrator.stop().await.unwrap();
    }
}

//! Configuration management for the FunnyShell daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/funnyshell/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("terminal geometry must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("client_queue_capacity must be between 1 and 65536, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("write_timeout_secs must be greater than 0")]
    InvalidWriteTimeout,

    #[error("ping_interval_secs must be greater than 0")]
    InvalidPingInterval,

    #[error("max_message_size must be at least 64 bytes, got {0}")]
    InvalidMaxMessageSize(usize),

    #[error("shell program not found: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for a client's outbound queue.
const MAX_QUEUE_CAPACITY: usize = 65536;

/// Main configuration structure for the FunnyShell daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP/WebSocket listener configuration.
    pub server: ServerConfig,

    /// The shared shell.
    pub shell: ShellConfig,

    /// Broadcast hub tuning.
    pub hub: HubConfig,

    /// Per-connection settings.
    pub client: ClientConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Directory served for every non-session request.
    pub web_dir: PathBuf,
}

/// Shell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell program to run.
    pub program: String,

    /// Arguments passed to the shell.
    pub args: Vec<String>,

    /// Fixed terminal width shared by every viewer.
    pub cols: u16,

    /// Fixed terminal height shared by every viewer.
    pub rows: u16,

    /// Value of `TERM` inside the shell.
    pub term: String,

    /// Value of `PS1` inside the shell.
    pub prompt: String,

    /// Environment variables copied from the daemon's environment.
    pub inherit_env: Vec<String>,

    /// Name prefixes of environment variables copied from the daemon's environment.
    pub inherit_env_prefixes: Vec<String>,

    /// Lines written to the shell right after it starts.
    pub startup_commands: Vec<String>,

    /// Shut the daemon down when the shell exits.
    pub exit_on_shell_exit: bool,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Outbound queue capacity per client; overflowing it evicts the client.
    pub client_queue_capacity: usize,

    /// Delay before nudging the shell with a newline after a join.
    pub join_prompt_delay_ms: u64,
}

/// Per-connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,

    /// Interval between WebSocket ping frames.
    pub ping_interval_secs: u64,

    /// Deadline for every outbound write.
    pub write_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            web_dir: PathBuf::from("./web"),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        let (program, args) = default_shell();
        Self {
            program,
            args,
            cols: 80,
            rows: 24,
            term: "vt100".to_string(),
            prompt: "$ ".to_string(),
            inherit_env: ["PATH", "HOME", "USER", "PWD", "LANG"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            inherit_env_prefixes: vec!["LC_".to_string()],
            startup_commands: vec![
                "clear".to_string(),
                "echo 'Welcome to FunnyShell - everyone here shares this terminal.'".to_string(),
                "echo 'Type a command and press Enter to run it.'".to_string(),
            ],
            exit_on_shell_exit: true,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 256,
            join_prompt_delay_ms: 500,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_message_size: 512,
            ping_interval_secs: 54,
            write_timeout_secs: 10,
        }
    }
}

impl HubConfig {
    /// Join prompt delay as a [`Duration`].
    pub fn join_prompt_delay(&self) -> Duration {
        Duration::from_millis(self.join_prompt_delay_ms)
    }
}

impl ClientConfig {
    /// Ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl ServerConfig {
    /// Returns the `host:port` string to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("funnyshell")
        .join("config.toml")
}

/// Returns the default shell and its arguments.
///
/// bash is started without rc files so every viewer sees the same plain
/// prompt; anything else gets no arguments.
fn default_shell() -> (String, Vec<String>) {
    if which::which("bash").is_ok() {
        (
            "bash".to_string(),
            vec!["--norc".to_string(), "--noprofile".to_string()],
        )
    } else {
        ("/bin/sh".to_string(), Vec::new())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FUNNYSHELL_PORT: Override the listening port
    /// - FUNNYSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - FUNNYSHELL_WEB_DIR: Override the static asset directory
    /// - FUNNYSHELL_SHELL: Override the shell program
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("FUNNYSHELL_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring invalid FUNNYSHELL_PORT {:?}: {}", port, e);
                }
            }
        }

        if let Ok(level) = std::env::var("FUNNYSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("FUNNYSHELL_WEB_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding web_dir from environment: {}", dir);
                self.server.web_dir = PathBuf::from(dir);
            }
        }

        if let Ok(shell) = std::env::var("FUNNYSHELL_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.shell.program = shell;
                self.shell.args.clear();
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.shell.cols == 0 || self.shell.rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: self.shell.cols,
                rows: self.shell.rows,
            });
        }

        let capacity = self.hub.client_queue_capacity;
        if capacity == 0 || capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::InvalidQueueCapacity(capacity));
        }

        if self.client.write_timeout_secs == 0 {
            return Err(ConfigError::InvalidWriteTimeout);
        }

        if self.client.ping_interval_secs == 0 {
            return Err(ConfigError::InvalidPingInterval);
        }

        if self.client.max_message_size < 64 {
            return Err(ConfigError::InvalidMaxMessageSize(
                self.client.max_message_size,
            ));
        }

        let shell_path = Path::new(&self.shell.program);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.shell.program.clone()));
            }
        } else if which::which(&self.shell.program).is_err() {
            return Err(ConfigError::InvalidShellPath(self.shell.program.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

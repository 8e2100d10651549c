//! PTY session management.
//!
//! A [`PtySession`] owns the pseudo-terminal and the shell running inside it.
//! The shell gets a sanitized environment and a fixed geometry so every
//! participant sees the same plain output.

use std::io::{Read, Write};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use crate::config::ShellConfig;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to obtain a reader for the PTY.
    #[error("failed to read from PTY: {0}")]
    ReadFailed(String),

    /// The PTY writer has already been handed out.
    #[error("PTY writer already taken")]
    WriterTaken,

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the shell.
    #[error("failed to kill shell: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status of the shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Shell is running.
    Running,
    /// Shell has exited with a code.
    Exited(u32),
}

/// A PTY with a shell process attached.
pub struct PtySession {
    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Input side of the PTY, until handed to the input writer.
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    /// The shell process.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    cols: u16,
    rows: u16,
    pid: Option<u32>,
}

impl PtySession {
    /// Opens a PTY and spawns the configured shell inside it.
    pub fn start(config: &ShellConfig) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(fixed_size(config.cols, config.rows))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(build_command(config))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // Only the shell may hold the slave side, otherwise reads never see
        // end-of-stream once it exits.
        drop(pair.slave);

        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let session = PtySession {
            master: Mutex::new(pair.master),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            cols: config.cols,
            rows: config.rows,
            pid,
        };

        session.resize_fixed()?;

        tracing::info!(
            pid = ?pid,
            program = %config.program,
            cols = config.cols,
            rows = config.rows,
            "Shell started"
        );

        Ok(session)
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the fixed terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Returns a new reader over the shell's output.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>, SessionError> {
        let master = self
            .master
            .lock()
            .map_err(|_| SessionError::ReadFailed("master lock poisoned".to_string()))?;
        master
            .try_clone_reader()
            .map_err(|e| SessionError::ReadFailed(e.to_string()))
    }

    /// Hands out the input side of the PTY. Succeeds once.
    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, SessionError> {
        self.writer
            .lock()
            .map_err(|_| SessionError::WriterTaken)?
            .take()
            .ok_or(SessionError::WriterTaken)
    }

    /// Re-applies the fixed geometry. Client-requested sizes are ignored.
    pub fn resize_fixed(&self) -> Result<(), SessionError> {
        let master = self
            .master
            .lock()
            .map_err(|_| SessionError::ResizeFailed("master lock poisoned".to_string()))?;
        master
            .resize(fixed_size(self.cols, self.rows))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        tracing::debug!(cols = self.cols, rows = self.rows, "Reset PTY size");
        Ok(())
    }

    /// Checks whether the shell has exited without waiting for it.
    pub fn try_wait(&self) -> Result<SessionStatus, SessionError> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| SessionError::KillFailed("child lock poisoned".to_string()))?;

        match child.try_wait()? {
            Some(status) => Ok(SessionStatus::Exited(status.exit_code())),
            None => Ok(SessionStatus::Running),
        }
    }

    /// Terminates the shell and reaps it.
    ///
    /// Blocks until the process is gone.
    pub fn kill(&self) -> Result<SessionStatus, SessionError> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| SessionError::KillFailed("child lock poisoned".to_string()))?;

        if let Some(status) = child.try_wait()? {
            return Ok(SessionStatus::Exited(status.exit_code()));
        }

        child
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        let status = child
            .wait()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        let session_status = SessionStatus::Exited(status.exit_code());
        tracing::info!(pid = ?self.pid, status = ?session_status, "Shell killed");
        Ok(session_status)
    }
}

fn fixed_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Builds the shell command with a scrubbed environment.
fn build_command(config: &ShellConfig) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&config.program);
    cmd.args(&config.args);

    if let Ok(dir) = std::env::current_dir() {
        cmd.cwd(dir);
    }

    cmd.env_clear();
    for (key, value) in inherited_env(config, std::env::vars()) {
        cmd.env(key, value);
    }
    for (key, value) in terminal_env(config) {
        cmd.env(key, value);
    }

    cmd
}

/// Selects the variables the shell inherits from the daemon.
fn inherited_env(
    config: &ShellConfig,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Vec<(String, String)> {
    vars.into_iter()
        .filter(|(key, _)| {
            config.inherit_env.iter().any(|name| name == key)
                || config
                    .inherit_env_prefixes
                    .iter()
                    .any(|prefix| key.starts_with(prefix.as_str()))
        })
        .collect()
}

/// Variables that keep the shell and common tools from emitting color or
/// prompting interactively.
fn terminal_env(config: &ShellConfig) -> Vec<(&'static str, String)> {
    vec![
        ("TERM", config.term.clone()),
        ("PS1", config.prompt.clone()),
        ("PROMPT_COMMAND", String::new()),
        ("LS_COLORS", String::new()),
        ("GREP_COLOR", String::new()),
        ("CLICOLOR", "0".to_string()),
        ("DEBIAN_FRONTEND", "noninteractive".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh_config() -> ShellConfig {
        ShellConfig {
            program: "/bin/sh".to_string(),
            args: vec![],
            startup_commands: vec![],
            ..ShellConfig::default()
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Reads from the PTY on a plain thread until `needle` appears.
    fn read_until(reader: Box<dyn Read + Send>, needle: &'static str) -> bool {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut seen = String::new();
            let mut buffer = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buffer) {
                if n == 0 {
                    break;
                }
                seen.push_str(&String::from_utf8_lossy(&buffer[..n]));
                if seen.contains(needle) {
                    let _ = tx.send(());
                    return;
                }
            }
        });
        rx.recv_timeout(Duration::from_secs(5)).is_ok()
    }

    #[test]
    fn test_inherited_env_allow_list() {
        let config = sh_config();
        let env = inherited_env(
            &config,
            vars(&[
                ("PATH", "/usr/bin"),
                ("HOME", "/home/alice"),
                ("LC_ALL", "C.UTF-8"),
                ("AWS_SECRET_ACCESS_KEY", "hunter2"),
                ("LS_COLORS", "di=01;34"),
            ]),
        );

        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["PATH", "HOME", "LC_ALL"]);
    }

    #[test]
    fn test_inherited_env_empty_allow_list() {
        let config = ShellConfig {
            inherit_env: vec![],
            inherit_env_prefixes: vec![],
            ..sh_config()
        };
        let env = inherited_env(&config, vars(&[("PATH", "/usr/bin")]));
        assert!(env.is_empty());
    }

    #[test]
    fn test_terminal_env_values() {
        let config = sh_config();
        let env = terminal_env(&config);
        assert!(env.contains(&("TERM", "vt100".to_string())));
        assert!(env.contains(&("PS1", "$ ".to_string())));
        assert!(env.contains(&("CLICOLOR", "0".to_string())));
        assert!(env.contains(&("DEBIAN_FRONTEND", "noninteractive".to_string())));
    }

    #[test]
    fn test_session_start() {
        let session = PtySession::start(&sh_config()).expect("spawn /bin/sh");
        assert!(session.pid().is_some());
        assert_eq!(session.size(), (80, 24));
        assert_eq!(session.try_wait().unwrap(), SessionStatus::Running);

        session.kill().unwrap();
    }

    #[test]
    fn test_spawn_failure_reported() {
        let config = ShellConfig {
            program: "/nonexistent/shell".to_string(),
            ..sh_config()
        };
        assert!(PtySession::start(&config).is_err());
    }

    #[test]
    fn test_writer_taken_once() {
        let session = PtySession::start(&sh_config()).unwrap();
        assert!(session.take_writer().is_ok());
        assert!(matches!(
            session.take_writer(),
            Err(SessionError::WriterTaken)
        ));
        session.kill().unwrap();
    }

    #[test]
    fn test_shell_sees_sanitized_env() {
        let session = PtySession::start(&sh_config()).unwrap();
        let reader = session.reader().unwrap();
        let mut writer = session.take_writer().unwrap();

        writer.write_all(b"echo \"term=[$TERM]\"\n").unwrap();
        writer.flush().unwrap();

        assert!(read_until(reader, "term=[vt100]"));
        session.kill().unwrap();
    }

    #[test]
    fn test_resize_fixed() {
        let session = PtySession::start(&sh_config()).unwrap();
        assert!(session.resize_fixed().is_ok());
        assert_eq!(session.size(), (80, 24));
        session.kill().unwrap();
    }

    #[test]
    fn test_try_wait_after_exit() {
        let session = PtySession::start(&sh_config()).unwrap();
        let mut writer = session.take_writer().unwrap();
        writer.write_all(b"exit 42\n").unwrap();
        writer.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut status = session.try_wait().unwrap();
        while status == SessionStatus::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            status = session.try_wait().unwrap();
        }
        assert_eq!(status, SessionStatus::Exited(42));
    }

    #[test]
    fn test_kill_after_exit_returns_status() {
        let session = PtySession::start(&sh_config()).unwrap();
        session.kill().unwrap();
        assert!(matches!(session.kill(), Ok(SessionStatus::Exited(_))));
    }
}

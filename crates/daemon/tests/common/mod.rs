//! Shared helpers for daemon integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use daemon::config::{Config, ShellConfig};
use daemon::orchestrator::DaemonOrchestrator;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Message, MessageKind};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for something to show up.
pub const WAIT: Duration = Duration::from_secs(5);

/// A running daemon on an ephemeral port with a plain `/bin/sh`.
pub struct TestDaemon {
    pub orchestrator: DaemonOrchestrator,
    pub addr: SocketAddr,
    _web_dir: TempDir,
}

impl TestDaemon {
    pub async fn start() -> Self {
        let web_dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.web_dir = web_dir.path().to_path_buf();
        config.hub.join_prompt_delay_ms = 50;
        config.shell = ShellConfig {
            program: "/bin/sh".to_string(),
            args: vec![],
            startup_commands: vec![],
            ..ShellConfig::default()
        };

        let mut orchestrator = DaemonOrchestrator::new(config);
        let addr = orchestrator.start().await.expect("daemon failed to start");

        Self {
            orchestrator,
            addr,
            _web_dir: web_dir,
        }
    }

    pub async fn connect(&self, username: Option<&str>) -> TestClient {
        TestClient::connect(self.addr, username).await
    }

    pub async fn stop(mut self) {
        self.orchestrator.stop().await.unwrap();
    }
}

/// WebSocket client that records every protocol message it receives.
pub struct TestClient {
    sink: SplitSink<WsStream, WsMessage>,
    stream: SplitStream<WsStream>,
    pub history: Vec<Message>,
    pub closed: bool,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, username: Option<&str>) -> Self {
        let url = match username {
            Some(name) => format!("ws://{}/ws?username={}", addr, name),
            None => format!("ws://{}/ws", addr),
        };
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .expect("Failed to connect");
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            history: Vec::new(),
            closed: false,
        }
    }

    pub async fn send(&mut self, message: &Message) {
        self.send_raw(&message.to_json().unwrap()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.sink
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    /// Reads until `done` holds for the history, the connection closes, or
    /// the wait runs out. Returns whether `done` held.
    pub async fn wait_until<F>(&mut self, mut done: F) -> bool
    where
        F: FnMut(&[Message]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !done(&self.history) {
            if self.closed {
                return false;
            }
            let frame = match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Ok(frame) => frame,
                Err(_) => return false,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let message = Message::from_json(text.as_str()).expect("server sent bad JSON");
                    self.history.push(message);
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => self.closed = true,
                Some(Ok(_)) => {}
            }
        }
        true
    }

    /// Waits for a system notice with exactly `text`.
    pub async fn wait_for_system(&mut self, text: &str) -> bool {
        self.wait_until(|history| has_system(history, text)).await
    }

    /// Waits for the server to close the connection.
    pub async fn wait_for_close(&mut self) -> bool {
        self.wait_until(|_| false).await;
        self.closed
    }
}

pub fn has_system(history: &[Message], text: &str) -> bool {
    history
        .iter()
        .any(|m| m.kind() == MessageKind::System && m.data() == text)
}

/// Concatenated shell output seen so far.
pub fn output_text(history: &[Message]) -> String {
    history
        .iter()
        .filter(|m| m.kind() == MessageKind::Output)
        .map(|m| m.data())
        .collect()
}

/// True when some output line, ignoring carriage returns, equals `line`.
pub fn output_has_line(history: &[Message], line: &str) -> bool {
    output_text(history)
        .split('\n')
        .any(|l| l.trim_end_matches('\r') == line)
}

//! Per-connection client session.
//!
//! Each WebSocket gets two pumps. The inbound pump runs on the connection's
//! own task: it decodes client frames and turns them into hub events. The
//! outbound pump is a spawned task that drains the client's queue onto the
//! socket and sends keepalive pings. Whichever pump stops first cancels the
//! other.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use protocol::{Message, MessageKind, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::hub::{ClientHandle, ClientId, HubError, HubHandle};

/// Longest display name kept, in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Errors on the outbound side of a connection.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A write did not complete before its deadline.
    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(Duration),

    /// The WebSocket transport failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// Picks the display name for a new connection.
///
/// Falls back to `anonymous-N`, where N is one more than the number of
/// clients currently registered.
pub fn display_name(requested: Option<&str>, hub: &HubHandle) -> String {
    normalize_name(requested)
        .unwrap_or_else(|| format!("anonymous-{}", hub.client_count() + 1))
}

fn normalize_name(requested: Option<&str>) -> Option<String> {
    let name: String = requested?
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    let name = name.trim();

    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Drives one WebSocket connection for its whole lifetime.
pub struct ClientSession {
    id: ClientId,
    name: String,
    hub: HubHandle,
}

impl ClientSession {
    /// Registers the client with the hub and pumps the socket until either
    /// side goes away.
    pub async fn run(
        socket: WebSocket,
        name: String,
        hub: HubHandle,
        config: ClientConfig,
        queue_capacity: usize,
    ) {
        let (handle, queue) = ClientHandle::new(name.clone(), queue_capacity);
        let session = ClientSession {
            id: handle.id(),
            name,
            hub,
        };

        if session.hub.register(handle).await.is_err() {
            tracing::warn!(name = %session.name, "Hub is not running, dropping connection");
            return;
        }

        tracing::info!(client_id = %session.id, name = %session.name, "Client connected");

        let (sink, stream) = socket.split();
        let cancel = CancellationToken::new();

        let outbound = tokio::spawn(write_pump(
            sink,
            queue,
            config,
            cancel.clone(),
            session.id,
        ));

        session.read_pump(stream, &cancel).await;

        // The hub closes the queue on removal, which lets the outbound pump
        // flush and send a close frame on its own.
        if session.hub.unregister(session.id).await.is_err() {
            cancel.cancel();
        }

        if let Err(e) = outbound.await {
            tracing::warn!(client_id = %session.id, error = %e, "Outbound pump failed");
        }

        tracing::info!(client_id = %session.id, name = %session.name, "Client disconnected");
    }

    async fn read_pump(&self, mut stream: SplitStream<WebSocket>, cancel: &CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(client_id = %self.id, "Outbound pump stopped, closing inbound");
                    break;
                }
                frame = stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        let e = ProtocolError::UnsupportedFrame("non-UTF-8 binary".to_string());
                        tracing::warn!(client_id = %self.id, error = %e, "Dropping client");
                        break;
                    }
                },
                Some(Ok(WsMessage::Close(_))) => {
                    tracing::debug!(client_id = %self.id, "Client sent close frame");
                    break;
                }
                // Ping/pong frames are answered by the transport.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(client_id = %self.id, error = %e, "WebSocket read failed");
                    break;
                }
                None => break,
            };

            let message = match Message::from_json(&text) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(client_id = %self.id, error = %e, "Malformed client message");
                    break;
                }
            };

            if self.dispatch(message).await.is_err() {
                tracing::debug!(client_id = %self.id, "Hub closed, stopping inbound pump");
                break;
            }
        }
    }

    /// Turns one client message into hub events.
    async fn dispatch(&self, message: Message) -> Result<(), HubError> {
        dispatch(message, &self.name, &self.hub).await
    }
}

pub(crate) async fn dispatch(message: Message, name: &str, hub: &HubHandle) -> Result<(), HubError> {
    match message.kind() {
        MessageKind::Input => {
            hub.input(message.data().as_bytes().to_vec()).await?;
            hub.broadcast(Message::input_info(name, message.data()))
                .await?;
        }
        MessageKind::Chat => {
            hub.broadcast(Message::chat(name, message.data())).await?;
        }
        MessageKind::Resize => hub.resize().await?,
        MessageKind::Ping => {}
        kind => {
            tracing::debug!(name = %name, kind = %kind, "Ignoring server-only message from client");
        }
    }
    Ok(())
}

/// Drains `queue` onto `sink` until the queue closes, a write fails or the
/// session is cancelled. Always cancels `cancel` on the way out.
async fn write_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Message>,
    config: ClientConfig,
    cancel: CancellationToken,
    id: ClientId,
) where
    S: Sink<WsMessage, Error = axum::Error> + Unpin,
{
    let deadline = config.write_timeout();
    let period = config.ping_interval();
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(message) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(client_id = %id, error = %e, "Failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = send_with_deadline(&mut sink, WsMessage::Text(text), deadline).await {
                        tracing::debug!(client_id = %id, error = %e, "Write failed");
                        break;
                    }
                }
                None => {
                    let _ = send_with_deadline(&mut sink, WsMessage::Close(None), deadline).await;
                    tracing::debug!(client_id = %id, "Queue closed by hub");
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = send_with_deadline(&mut sink, WsMessage::Ping(Vec::new()), deadline).await {
                    tracing::debug!(client_id = %id, error = %e, "Ping failed");
                    break;
                }
            }
        }
    }

    cancel.cancel();
}

async fn send_with_deadline<S>(
    sink: &mut S,
    frame: WsMessage,
    deadline: Duration,
) -> Result<(), ClientError>
where
    S: Sink<WsMessage, Error = axum::Error> + Unpin,
{
    timeout(deadline, sink.send(frame))
        .await
        .map_err(|_| ClientError::WriteTimeout(deadline))??;
    Ok(())
}

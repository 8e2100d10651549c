//! The session hub.
//!
//! The hub is a single task that owns the client registry. Registrations,
//! broadcasts, shell input and resize requests all arrive through one bounded
//! inbox and are handled strictly one at a time, so every client observes
//! broadcasts in the same order and the registry needs no locking.
//!
//! Handling an event never waits on a client or on the shell:
//!
//! - fan-out uses `try_send`, and a client whose queue is full or closed is
//!   evicted on the spot;
//! - shell input is handed to a [`Terminal`], which queues it for the single
//!   PTY writer.
//!
//! ```text
//! ClientSession ──┐                      ┌──▶ client queue ──▶ ClientSession
//! OutputReader  ──┼──▶ HubEvent inbox ──▶ Hub ──▶ client queue ──▶ ClientSession
//! ClientSession ──┘                      └──▶ Terminal (input, resize)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use protocol::Message;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::HubConfig;

/// Unique identifier for a connected client.
pub type ClientId = Uuid;

/// Capacity of the hub inbox.
const HUB_INBOX_CAPACITY: usize = 64;

/// The shell as seen by the hub.
///
/// Implementations must return promptly: the hub calls them from its event
/// loop.
pub trait Terminal: Send + Sync + 'static {
    /// Queues raw input bytes for the shell.
    fn write_input(&self, data: Vec<u8>);

    /// Re-applies the fixed terminal geometry.
    fn reset_size(&self);
}

/// Errors returned by [`HubHandle`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The hub event loop has stopped.
    #[error("hub is not running")]
    Closed,
}

/// A registered client as seen by the hub.
///
/// The hub holds the only sender for the client's queue, so the queue closes
/// exactly when the hub removes the client.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    name: String,
    tx: mpsc::Sender<Message>,
    delivered: u64,
}

enum Delivery {
    Delivered,
    Full,
    Closed,
}

impl ClientHandle {
    /// Creates a handle and the receiving end of its outbound queue.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tx,
            delivered: 0,
        };
        (handle, rx)
    }

    /// Returns the client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Returns the display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn try_deliver(&mut self, message: Message) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.delivered += 1;
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Snapshot entry returned by [`HubHandle::participants`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ClientId,
    pub name: String,
}

/// Events processed by the hub.
#[derive(Debug)]
pub enum HubEvent {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Message),
    Input(Vec<u8>),
    Resize,
    Participants(oneshot::Sender<Vec<Participant>>),
}

/// Cloneable handle for sending events to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubEvent>,
    client_count: Arc<AtomicUsize>,
}

impl HubHandle {
    /// Adds a client and announces it to everyone.
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.send(HubEvent::Register(client)).await
    }

    /// Removes a client. Removing an unknown client is a no-op.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.send(HubEvent::Unregister(id)).await
    }

    /// Delivers `message` to every registered client.
    pub async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.send(HubEvent::Broadcast(message)).await
    }

    /// Forwards input bytes to the shell.
    pub async fn input(&self, data: impl Into<Vec<u8>>) -> Result<(), HubError> {
        self.send(HubEvent::Input(data.into())).await
    }

    /// Asks the hub to re-apply the fixed terminal size.
    pub async fn resize(&self) -> Result<(), HubError> {
        self.send(HubEvent::Resize).await
    }

    /// Returns the currently registered clients.
    pub async fn participants(&self) -> Result<Vec<Participant>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubEvent::Participants(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Returns the number of registered clients as last published by the hub.
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    /// Returns true once the hub event loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, event: HubEvent) -> Result<(), HubError> {
        self.tx.send(event).await.map_err(|_| HubError::Closed)
    }
}

/// The hub event loop state.
pub struct Hub<T: Terminal> {
    inbox: mpsc::Receiver<HubEvent>,
    /// Used to feed delayed events back into the inbox without keeping it
    /// open.
    loopback: mpsc::WeakSender<HubEvent>,
    clients: HashMap<ClientId, ClientHandle>,
    terminal: Arc<T>,
    config: HubConfig,
    client_count: Arc<AtomicUsize>,
    /// Broadcasts produced while handling the current event.
    pending: VecDeque<Message>,
}

impl<T: Terminal> Hub<T> {
    /// Creates a hub driving `terminal`, and the handle used to reach it.
    pub fn new(terminal: Arc<T>, config: HubConfig) -> (Self, HubHandle) {
        let (tx, inbox) = mpsc::channel(HUB_INBOX_CAPACITY);
        let client_count = Arc::new(AtomicUsize::new(0));

        let hub = Self {
            inbox,
            loopback: tx.downgrade(),
            clients: HashMap::new(),
            terminal,
            config,
            client_count: Arc::clone(&client_count),
            pending: VecDeque::new(),
        };
        let handle = HubHandle { tx, client_count };

        (hub, handle)
    }

    /// Runs the event loop until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        tracing::info!("Hub started");

        while let Some(event) = self.inbox.recv().await {
            self.handle_event(event);
        }

        tracing::info!(clients = self.clients.len(), "Hub stopped");
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(client) => self.register(client),
            HubEvent::Unregister(id) => self.unregister(id),
            HubEvent::Broadcast(message) => self.broadcast(message),
            HubEvent::Input(data) => self.terminal.write_input(data),
            HubEvent::Resize => self.terminal.reset_size(),
            HubEvent::Participants(reply) => {
                let _ = reply.send(self.participants());
            }
        }
    }

    fn register(&mut self, client: ClientHandle) {
        let id = client.id;
        let name = client.name.clone();

        self.clients.insert(id, client);
        self.publish_count();

        tracing::info!(
            client_id = %id,
            name = %name,
            clients = self.clients.len(),
            "Client registered"
        );

        self.broadcast(Message::system(format!(
            "{} joined ({} online)",
            name,
            self.clients.len()
        )));
        self.schedule_prompt_refresh();
    }

    fn unregister(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            tracing::trace!(client_id = %id, "Unregister for unknown client ignored");
            return;
        };
        self.publish_count();

        tracing::info!(
            client_id = %id,
            name = %client.name,
            delivered = client.delivered,
            clients = self.clients.len(),
            "Client unregistered"
        );

        let notice = format!("{} left ({} online)", client.name, self.clients.len());
        drop(client);
        self.broadcast(Message::system(notice));
    }

    fn broadcast(&mut self, message: Message) {
        self.pending.push_back(message);

        while let Some(message) = self.pending.pop_front() {
            for client in self.fan_out(message) {
                let notice = format!(
                    "{} was disconnected ({} online)",
                    client.name,
                    self.clients.len()
                );
                self.pending.push_back(Message::system(notice));
            }
        }
    }

    /// Delivers `message` to every client and returns the ones evicted.
    fn fan_out(&mut self, message: Message) -> Vec<ClientHandle> {
        let mut evicted = Vec::new();

        for (id, client) in self.clients.iter_mut() {
            match client.try_deliver(message.clone()) {
                Delivery::Delivered => {}
                Delivery::Full => {
                    tracing::warn!(
                        client_id = %id,
                        name = %client.name,
                        "Client queue full, evicting"
                    );
                    evicted.push(*id);
                }
                Delivery::Closed => {
                    tracing::debug!(
                        client_id = %id,
                        name = %client.name,
                        "Client queue closed, evicting"
                    );
                    evicted.push(*id);
                }
            }
        }

        let removed: Vec<ClientHandle> = evicted
            .iter()
            .filter_map(|id| self.clients.remove(id))
            .collect();

        if !removed.is_empty() {
            self.publish_count();
        }

        removed
    }

    /// Nudges the shell with a newline shortly after a join so the newcomer
    /// sees a fresh prompt.
    fn schedule_prompt_refresh(&self) {
        let loopback = self.loopback.clone();
        let delay = self.config.join_prompt_delay();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(HubEvent::Input(b"\n".to_vec())).await;
            }
        });
    }

    fn participants(&self) -> Vec<Participant> {
        self.clients
            .values()
            .map(|client| Participant {
                id: client.id,
                name: client.name.clone(),
            })
            .collect()
    }

    fn publish_count(&self) {
        self.client_count
            .store(self.clients.len(), Ordering::Release);
    }
}

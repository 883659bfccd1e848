use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::error::{AdminError, Result};
use super::auth::{CredentialStore, TokenKind};
use super::event_handler::{EventHandler, Subscription};
use super::websocket::{ClientEvent, Connector, EventKind, ServerEvent, TransportEvent};

/// One live connection to the admin namespace
pub struct Channel {
    id: u64,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    events: Arc<EventHandler>,
    connected: Arc<AtomicBool>,
}

impl Channel {
    /// Fire-and-forget send
    pub fn emit(&self, event: ClientEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(AdminError::Transport("Channel is disconnected".to_string()));
        }
        debug!("Emitting {:?}", event);
        self.outbound.send(event)
            .map_err(|_| AdminError::Transport("Channel writer has stopped".to_string()))
    }

    /// Listen for one event kind until the handle is dropped.
    ///
    /// Subscriptions belong to the manager's dispatcher, so they keep
    /// receiving events from whatever connection replaces this one.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, callback)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.events.listener_count(kind)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Identifies the underlying connection; changes when it is re-created
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Owns the process-wide realtime connection.
///
/// The connection is opened lazily by the first `acquire` and forgotten on
/// disconnect, so the next `acquire` reconnects with whatever access token is
/// current at that moment. The event dispatcher outlives connections.
pub struct ChannelManager {
    endpoint: String,
    credentials: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    events: Arc<EventHandler>,
    current: Arc<Mutex<Option<Arc<Channel>>>>,
    next_id: AtomicU64,
}

impl ChannelManager {
    pub fn new(
        endpoint: String,
        credentials: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            connector,
            events: EventHandler::new(),
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Listen for one event kind across every connection the manager opens
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, callback)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.events.listener_count(kind)
    }

    /// Return the live channel, connecting one if there is none
    pub async fn acquire(&self) -> Result<Arc<Channel>> {
        let mut current = self.current.lock().await;

        if let Some(channel) = current.as_ref() {
            if channel.is_connected() {
                return Ok(channel.clone());
            }
            debug!("Dropping stale channel {}", channel.id);
            *current = None;
        }

        let access_token = self.credentials.get(TokenKind::Access)?;
        let connection = match self.connector.connect(&self.endpoint, access_token).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Realtime channel connection error: {}", e);
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(Channel {
            id,
            outbound: connection.outbound,
            events: self.events.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        });

        self.spawn_reader(&channel, connection.inbound);

        info!("Realtime channel {} established", id);
        *current = Some(channel.clone());
        Ok(channel)
    }

    /// Drop the current channel, if any
    pub async fn release(&self) {
        if let Some(channel) = self.current.lock().await.take() {
            channel.connected.store(false, Ordering::SeqCst);
            info!("Realtime channel {} released", channel.id);
        }
    }

    /// Whether a live channel is currently held
    pub async fn is_connected(&self) -> bool {
        self.current.lock().await
            .as_ref()
            .is_some_and(|channel| channel.is_connected())
    }

    fn spawn_reader(&self, channel: &Arc<Channel>, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        let id = channel.id;
        let events = channel.events.clone();
        let connected = channel.connected.clone();
        let current = self.current.clone();

        tokio::spawn(async move {
            let reason = loop {
                match inbound.recv().await {
                    // A released connection must not feed the shared dispatcher
                    Some(TransportEvent::Message(_)) if !connected.load(Ordering::SeqCst) => {
                        break "released".to_string();
                    }
                    Some(TransportEvent::Message(event)) => {
                        events.handle_message(&event);
                    }
                    Some(TransportEvent::Closed(reason)) => break reason,
                    None => break "transport dropped".to_string(),
                }
            };

            connected.store(false, Ordering::SeqCst);
            info!("Realtime channel {} disconnected: {}", id, reason);

            let mut current = current.lock().await;
            if current.as_ref().is_some_and(|channel| channel.id == id) {
                *current = None;
            }
        });
    }
}

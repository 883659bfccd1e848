use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{AdminError, Result};

/// A pending user or vehicle record. Only `id` is interpreted; everything else
/// is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: serde_json::Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Page request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page: u32,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

/// Connection-time authentication payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub access_token: Option<String>,
}

/// A page (or single pushed item) of level 2 user requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

/// A page (or single pushed item) of vehicle listing requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicles: Option<Vec<Record>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDecision {
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDecision {
    pub vehicle_id: i64,
}

/// Frames sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "auth")]
    Auth(AuthPayload),

    #[serde(rename = "getRequestedUserLevel2")]
    GetRequestedUserLevel2(PageQuery),

    #[serde(rename = "getRequestedVehicles")]
    GetRequestedVehicles(PageQuery),
}

/// Frames pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Answer to `getRequestedUserLevel2`
    #[serde(rename = "requestedUserLevel2")]
    RequestedUserLevel2(UserPage),

    /// A user submitted a new level 2 request
    #[serde(rename = "newUserRequest")]
    NewUserRequest(UserPage),

    /// Another admin decided a user request
    #[serde(rename = "decisionUserLevel2")]
    DecisionUserLevel2(UserDecision),

    /// Answer to `getRequestedVehicles`
    #[serde(rename = "requestedVehicles")]
    RequestedVehicles(VehiclePage),

    /// A new vehicle listing awaits review
    #[serde(rename = "newVehicleRequest")]
    NewVehicleRequest(VehiclePage),

    /// Another admin decided a vehicle request
    #[serde(rename = "decisionVehicle")]
    DecisionVehicle(VehicleDecision),
}

/// Discriminant of [`ServerEvent`], used as the dispatcher table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestedUserLevel2,
    NewUserRequest,
    DecisionUserLevel2,
    RequestedVehicles,
    NewVehicleRequest,
    DecisionVehicle,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RequestedUserLevel2(_) => EventKind::RequestedUserLevel2,
            Self::NewUserRequest(_) => EventKind::NewUserRequest,
            Self::DecisionUserLevel2(_) => EventKind::DecisionUserLevel2,
            Self::RequestedVehicles(_) => EventKind::RequestedVehicles,
            Self::NewVehicleRequest(_) => EventKind::NewVehicleRequest,
            Self::DecisionVehicle(_) => EventKind::DecisionVehicle,
        }
    }
}

/// What a transport reports upward
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ServerEvent),
    Closed(String),
}

/// Both halves of an established connection
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens realtime connections. The channel manager owns one at a time.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str, access_token: Option<String>) -> Result<Connection>;
}

/// WebSocket transport speaking JSON `{event, data}` text frames
pub struct WebSocketConnector {
    heartbeat: Duration,
}

impl WebSocketConnector {
    pub fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str, access_token: Option<String>) -> Result<Connection> {
        debug!("Connecting realtime channel to {}", endpoint);

        let (ws_stream, response) = connect_async(endpoint).await
            .map_err(|e| AdminError::Transport(format!("Failed to connect to {}: {}", endpoint, e)))?;
        debug!("WebSocket handshake completed with status {}", response.status());

        let (mut sink, mut stream) = ws_stream.split();

        let auth = serde_json::to_string(&ClientEvent::Auth(AuthPayload { access_token }))?;
        sink.send(Message::Text(auth)).await
            .map_err(|e| AdminError::Transport(format!("Failed to authenticate channel: {}", e)))?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: forwards emitted events and keeps the connection alive
        let heartbeat_every = self.heartbeat;
        tokio::spawn(async move {
            let mut heartbeat = interval(heartbeat_every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    event = outbound_rx.recv() => {
                        let Some(event) = event else {
                            // Channel released by its owner
                            let _ = sink.close().await;
                            break;
                        };
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("Failed to serialize channel event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            warn!("Failed to send channel event: {}", e);
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            debug!("Heartbeat failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        // Reader: decodes server frames until the socket goes away
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if inbound_tx.send(TransportEvent::Message(event)).is_err() {
                                    break "channel released".to_string();
                                }
                            }
                            Err(e) => {
                                debug!("Ignoring unrecognised channel frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by server: {}", frame.reason),
                            None => "closed by server".to_string(),
                        };
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
        });

        info!("Realtime channel connected to {}", endpoint);
        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// In-process connector: each connection hands a [`ServerHandle`] to whoever
/// plays the server side.
pub struct MemoryConnector {
    sessions: mpsc::UnboundedSender<ServerHandle>,
    refusing: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerHandle>) {
        let (sessions, sessions_rx) = mpsc::unbounded_channel();
        let connector = Self {
            sessions,
            refusing: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        };
        (connector, sessions_rx)
    }

    /// Make subsequent connection attempts fail
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of successful connections so far
    pub fn connection_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str, access_token: Option<String>) -> Result<Connection> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(AdminError::Transport(format!("Connection to {} refused", endpoint)));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let handle = ServerHandle {
            access_token,
            received: outbound_rx,
            deliver: inbound_tx,
        };
        self.sessions.send(handle)
            .map_err(|_| AdminError::Transport("No server is listening".to_string()))?;

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Server side of a [`MemoryConnector`] connection. Dropping it disconnects.
pub struct ServerHandle {
    access_token: Option<String>,
    received: mpsc::UnboundedReceiver<ClientEvent>,
    deliver: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerHandle {
    /// Token presented at connect time
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Next event emitted by the client; `None` once the client released the channel
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.received.recv().await
    }

    /// Event already emitted, if any
    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.received.try_recv().ok()
    }

    /// Push an event to the client
    pub fn push(&self, event: ServerEvent) -> bool {
        self.deliver.send(TransportEvent::Message(event)).is_ok()
    }

    /// Close the connection from the server side
    pub fn disconnect(&self, reason: &str) {
        let _ = self.deliver.send(TransportEvent::Closed(reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fetch_frame_shape() {
        let event = ClientEvent::GetRequestedUserLevel2(PageQuery {
            page: 2,
            limit: 5,
            request_id: Some(7),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "getRequestedUserLevel2", "data": {"page": 2, "limit": 5, "requestId": 7}})
        );

        let auth = ClientEvent::Auth(AuthPayload { access_token: Some("t".into()) });
        assert_eq!(
            serde_json::to_value(&auth).unwrap(),
            json!({"event": "auth", "data": {"accessToken": "t"}})
        );
    }

    #[test]
    fn test_server_frames_parse() {
        let page: ServerEvent = serde_json::from_value(json!({
            "event": "requestedVehicles",
            "data": {
                "vehicles": [{"id": 4, "licensePlate": "51A-12345", "owner": {"name": "An"}}],
                "totalPages": 2,
                "currentPage": 1
            }
        })).unwrap();

        let ServerEvent::RequestedVehicles(page) = &page else {
            panic!("unexpected event {:?}", page);
        };
        let vehicles = page.vehicles.as_ref().unwrap();
        assert_eq!(vehicles[0].id, 4);
        assert_eq!(vehicles[0].fields["licensePlate"], "51A-12345");
        assert_eq!(page.total_pages, Some(2));
        assert_eq!(page.request_id, None);

        let decision: ServerEvent = serde_json::from_value(json!({
            "event": "decisionUserLevel2",
            "data": {"userId": 3}
        })).unwrap();
        assert_eq!(decision.kind(), EventKind::DecisionUserLevel2);
        assert_eq!(decision, ServerEvent::DecisionUserLevel2(UserDecision { user_id: 3 }));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result = serde_json::from_value::<ServerEvent>(json!({"event": "somethingElse", "data": {}}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_memory_connector_hands_out_sessions() {
        let (connector, mut sessions) = MemoryConnector::new();
        let mut connection = connector.connect("ws://test/admin", Some("tok".into())).await.unwrap();
        let mut server = sessions.recv().await.unwrap();

        assert_eq!(server.access_token(), Some("tok"));
        assert_eq!(connector.connection_count(), 1);

        let query = PageQuery { page: 1, limit: 5, request_id: None };
        connection.outbound.send(ClientEvent::GetRequestedVehicles(query.clone())).unwrap();
        assert_eq!(server.next_event().await, Some(ClientEvent::GetRequestedVehicles(query)));

        server.disconnect("bye");
        assert!(matches!(connection.inbound.recv().await, Some(TransportEvent::Closed(r)) if r == "bye"));

        connector.set_refusing(true);
        assert!(matches!(
            connector.connect("ws://test/admin", None).await,
            Err(AdminError::Transport(_))
        ));
    }
}

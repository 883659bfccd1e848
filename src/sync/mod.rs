pub mod auth;
pub mod api;
pub mod channel;
pub mod event_handler;
pub mod gateway;
pub mod list_sync;
pub mod websocket;

pub use auth::{CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenKind};
pub use api::{AdminApi, Decision, ListQuery};
pub use channel::{Channel, ChannelManager};
pub use event_handler::{EventHandler, Subscription};
pub use gateway::{ApiRequest, AuthGateway};
pub use list_sync::{
    ListSync, PageState, SyncPhase, SyncResource, UserRequestSync, UserRequests,
    VehicleRequestSync, VehicleRequests,
};
pub use websocket::{
    ClientEvent, Connector, EventKind, MemoryConnector, Record, ServerEvent, ServerHandle,
    WebSocketConnector,
};

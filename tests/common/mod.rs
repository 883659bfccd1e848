#![allow(dead_code)]

use rental_admin::sync::{
    AuthGateway, ChannelManager, CredentialStore, MemoryConnector, MemoryCredentialStore,
    PageState, Record, ServerHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(2);

/// Route library logs to the test harness output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rental_admin=debug")
        .with_test_writer()
        .try_init();
}

pub fn credentials(access: Option<&str>, refresh: Option<&str>) -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::with_tokens(access, refresh))
}

pub fn gateway(base_url: &str, timeout: Duration, store: Arc<MemoryCredentialStore>) -> AuthGateway {
    let store: Arc<dyn CredentialStore> = store;
    AuthGateway::new(base_url.to_string(), timeout, store).expect("gateway")
}

/// Realtime test rig: a manager over an in-memory connector
pub struct ChannelRig {
    pub manager: Arc<ChannelManager>,
    pub connector: Arc<MemoryConnector>,
    pub sessions: mpsc::UnboundedReceiver<ServerHandle>,
    pub credentials: Arc<MemoryCredentialStore>,
}

impl ChannelRig {
    pub fn new(access_token: Option<&str>) -> Self {
        let (connector, sessions) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let credentials = credentials(access_token, Some("refresh"));
        let manager = Arc::new(ChannelManager::new(
            "ws://test.local/admin".to_string(),
            credentials.clone(),
            connector.clone(),
        ));
        Self {
            manager,
            connector,
            sessions,
            credentials,
        }
    }

    /// Server side of the next connection the client opens
    pub async fn next_session(&mut self) -> ServerHandle {
        tokio::time::timeout(WAIT, self.sessions.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

pub fn record(id: i64) -> Record {
    Record::new(id).with_field("name", format!("record-{}", id))
}

pub fn records(ids: impl IntoIterator<Item = i64>) -> Vec<Record> {
    ids.into_iter().map(record).collect()
}

/// Wait until the state satisfies `condition`
pub async fn wait_for_state<F>(rx: &mut watch::Receiver<PageState>, condition: F) -> PageState
where
    F: FnMut(&PageState) -> bool,
{
    tokio::time::timeout(WAIT, rx.wait_for(condition))
        .await
        .expect("timed out waiting for state")
        .expect("state sender dropped")
        .clone()
}

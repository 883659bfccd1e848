use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use super::channel::ChannelManager;
use super::event_handler::Subscription;
use super::websocket::{ClientEvent, EventKind, PageQuery, Record, ServerEvent};

/// Where a list is in its fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    FetchRequested,
    AwaitingServer,
    Settled,
}

/// Snapshot of one synchronized list
#[derive(Debug, Clone, PartialEq)]
pub struct PageState {
    pub items: Vec<Record>,
    pub current_page: u32,
    pub total_pages: u32,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: SyncPhase,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            current_page: 1,
            total_pages: 1,
            loading: false,
            error: None,
            phase: SyncPhase::Idle,
        }
    }
}

impl PageState {
    pub fn contains(&self, id: i64) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    pub fn ids(&self) -> Vec<i64> {
        self.items.iter().map(|item| item.id).collect()
    }
}

/// A page response, independent of resource type
#[derive(Debug, Clone)]
pub struct PageUpdate {
    pub items: Option<Vec<Record>>,
    pub total_pages: Option<u32>,
    pub current_page: Option<u32>,
    pub request_id: Option<u64>,
}

/// Event vocabulary of one synchronized resource
pub trait SyncResource: Send + Sync + 'static {
    const NAME: &'static str;
    const PAGE_EVENT: EventKind;
    const PUSH_EVENT: EventKind;
    const DECISION_EVENT: EventKind;

    fn fetch(query: PageQuery) -> ClientEvent;

    fn page(event: &ServerEvent) -> Option<PageUpdate>;

    /// First item of a new-request push
    fn pushed(event: &ServerEvent) -> Option<Record>;

    /// Id removed by a decision push
    fn decided(event: &ServerEvent) -> Option<i64>;
}

/// Pending level 2 user verifications
pub struct UserRequests;

impl SyncResource for UserRequests {
    const NAME: &'static str = "user requests";
    const PAGE_EVENT: EventKind = EventKind::RequestedUserLevel2;
    const PUSH_EVENT: EventKind = EventKind::NewUserRequest;
    const DECISION_EVENT: EventKind = EventKind::DecisionUserLevel2;

    fn fetch(query: PageQuery) -> ClientEvent {
        ClientEvent::GetRequestedUserLevel2(query)
    }

    fn page(event: &ServerEvent) -> Option<PageUpdate> {
        match event {
            ServerEvent::RequestedUserLevel2(page) => Some(PageUpdate {
                items: page.users.clone(),
                total_pages: page.total_pages,
                current_page: page.current_page,
                request_id: page.request_id,
            }),
            _ => None,
        }
    }

    fn pushed(event: &ServerEvent) -> Option<Record> {
        match event {
            ServerEvent::NewUserRequest(page) => page.users.as_ref()?.first().cloned(),
            _ => None,
        }
    }

    fn decided(event: &ServerEvent) -> Option<i64> {
        match event {
            ServerEvent::DecisionUserLevel2(decision) => Some(decision.user_id),
            _ => None,
        }
    }
}

/// Pending vehicle listings
pub struct VehicleRequests;

impl SyncResource for VehicleRequests {
    const NAME: &'static str = "vehicle requests";
    const PAGE_EVENT: EventKind = EventKind::RequestedVehicles;
    const PUSH_EVENT: EventKind = EventKind::NewVehicleRequest;
    const DECISION_EVENT: EventKind = EventKind::DecisionVehicle;

    fn fetch(query: PageQuery) -> ClientEvent {
        ClientEvent::GetRequestedVehicles(query)
    }

    fn page(event: &ServerEvent) -> Option<PageUpdate> {
        match event {
            ServerEvent::RequestedVehicles(page) => Some(PageUpdate {
                items: page.vehicles.clone(),
                total_pages: page.total_pages,
                current_page: page.current_page,
                request_id: page.request_id,
            }),
            _ => None,
        }
    }

    fn pushed(event: &ServerEvent) -> Option<Record> {
        match event {
            ServerEvent::NewVehicleRequest(page) => page.vehicles.as_ref()?.first().cloned(),
            _ => None,
        }
    }

    fn decided(event: &ServerEvent) -> Option<i64> {
        match event {
            ServerEvent::DecisionVehicle(decision) => Some(decision.vehicle_id),
            _ => None,
        }
    }
}

pub type UserRequestSync = ListSync<UserRequests>;
pub type VehicleRequestSync = ListSync<VehicleRequests>;

/// Keeps one paginated request list in step with the realtime channel.
///
/// Each page change drops the previous page's subscriptions before
/// registering new ones; dropping the `ListSync` releases them all.
pub struct ListSync<R: SyncResource> {
    manager: Arc<ChannelManager>,
    limit: u32,
    state: Arc<watch::Sender<PageState>>,
    latest_request: Arc<AtomicU64>,
    subscriptions: Vec<Subscription>,
    _resource: PhantomData<R>,
}

impl<R: SyncResource> ListSync<R> {
    /// Idle instance; nothing is fetched until `set_page`
    pub fn new(manager: Arc<ChannelManager>, limit: u32) -> Self {
        let (state, _) = watch::channel(PageState::default());
        Self {
            manager,
            limit: limit.max(1),
            state: Arc::new(state),
            latest_request: Arc::new(AtomicU64::new(0)),
            subscriptions: Vec::new(),
            _resource: PhantomData,
        }
    }

    /// Create and immediately fetch `page`.
    ///
    /// A connection failure is recorded in the state rather than returned, so
    /// the consumer can still render and retry with `set_page`.
    pub async fn activate(manager: Arc<ChannelManager>, limit: u32, page: u32) -> Self {
        let mut sync = Self::new(manager, limit);
        if let Err(e) = sync.set_page(page).await {
            warn!("Initial fetch of {} failed: {}", R::NAME, e);
        }
        sync
    }

    /// Switch to `page` and request it from the server
    pub async fn set_page(&mut self, page: u32) -> Result<()> {
        let page = page.max(1);

        self.subscriptions.clear();
        let request_id = self.latest_request.fetch_add(1, Ordering::SeqCst) + 1;

        self.state.send_modify(|state| {
            state.current_page = page;
            state.loading = true;
            state.error = None;
            state.phase = SyncPhase::FetchRequested;
        });

        let channel = match self.manager.acquire().await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(&e.to_string());
                return Err(e);
            }
        };

        self.subscriptions = vec![
            channel.subscribe(R::PAGE_EVENT, self.page_handler(page, request_id)),
            channel.subscribe(R::PUSH_EVENT, self.push_handler(page)),
            channel.subscribe(R::DECISION_EVENT, self.decision_handler()),
        ];

        let query = PageQuery {
            page,
            limit: self.limit,
            request_id: Some(request_id),
        };
        if let Err(e) = channel.emit(R::fetch(query)) {
            self.fail(&e.to_string());
            return Err(e);
        }

        // The response may already have landed on the reader task
        self.state.send_if_modified(|state| {
            if state.phase == SyncPhase::FetchRequested {
                state.phase = SyncPhase::AwaitingServer;
                true
            } else {
                false
            }
        });

        debug!("Requested {} page {} (request {})", R::NAME, page, request_id);
        Ok(())
    }

    /// Drop `id` locally without waiting for the server; returns whether it was present
    pub fn remove(&self, id: i64) -> bool {
        let removed = remove_item(&self.state, id);
        if removed {
            debug!("Optimistically removed {} from {}", id, R::NAME);
        }
        removed
    }

    pub fn state(&self) -> PageState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<PageState> {
        self.state.subscribe()
    }

    /// Latest fetch sequence number issued by this instance
    pub fn latest_request(&self) -> u64 {
        self.latest_request.load(Ordering::SeqCst)
    }

    fn fail(&mut self, message: &str) {
        self.subscriptions.clear();
        self.state.send_modify(|state| {
            state.loading = false;
            state.error = Some(message.to_string());
            state.phase = SyncPhase::Idle;
        });
    }

    fn page_handler(&self, page: u32, request_id: u64) -> impl Fn(&ServerEvent) + Send + Sync + 'static {
        let state = self.state.clone();
        let latest = self.latest_request.clone();

        move |event: &ServerEvent| {
            let Some(update) = R::page(event) else {
                return;
            };

            // An echoed request id is authoritative, even if the server moved the page
            let echoed = update.request_id == Some(request_id);
            if latest.load(Ordering::SeqCst) != request_id
                || update.request_id.is_some_and(|id| id != request_id)
                || (!echoed && update.current_page.is_some_and(|current| current != page))
            {
                debug!(
                    "Discarding stale {} response (page {:?}, request {:?})",
                    R::NAME, update.current_page, update.request_id
                );
                return;
            }

            if update.total_pages.is_none() {
                warn!("{} page response without totalPages; keeping previous total", R::NAME);
            }

            state.send_modify(|state| {
                if let Some(current) = update.current_page.filter(|_| echoed) {
                    state.current_page = current.max(1);
                }
                if let Some(items) = update.items {
                    state.items = items;
                }
                if let Some(total) = update.total_pages {
                    state.total_pages = total.max(1);
                }
                state.loading = false;
                state.phase = SyncPhase::Settled;
            });
        }
    }

    fn push_handler(&self, page: u32) -> impl Fn(&ServerEvent) + Send + Sync + 'static {
        let state = self.state.clone();

        move |event: &ServerEvent| {
            if page != 1 {
                return;
            }
            let Some(item) = R::pushed(event) else {
                return;
            };

            info!("New {} entry {}", R::NAME, item.id);
            state.send_modify(|state| {
                state.items.retain(|existing| existing.id != item.id);
                state.items.insert(0, item);
            });
        }
    }

    fn decision_handler(&self) -> impl Fn(&ServerEvent) + Send + Sync + 'static {
        let state = self.state.clone();

        move |event: &ServerEvent| {
            if let Some(id) = R::decided(event) {
                if remove_item(&state, id) {
                    info!("{} entry {} decided elsewhere", R::NAME, id);
                }
            }
        }
    }
}

fn remove_item(state: &watch::Sender<PageState>, id: i64) -> bool {
    state.send_if_modified(|state| {
        let before = state.items.len();
        state.items.retain(|item| item.id != id);
        state.items.len() != before
    })
}

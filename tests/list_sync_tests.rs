mod common;

use common::{record, records, wait_for_state, ChannelRig};
use rental_admin::sync::websocket::{PageQuery, UserDecision, UserPage, VehicleDecision, VehiclePage};
use rental_admin::sync::{
    ClientEvent, EventKind, ServerEvent, ServerHandle, SyncPhase, UserRequestSync, VehicleRequestSync,
};

fn user_page(ids: impl IntoIterator<Item = i64>, total_pages: u32, current_page: u32) -> ServerEvent {
    ServerEvent::RequestedUserLevel2(UserPage {
        users: Some(records(ids)),
        total_pages: Some(total_pages),
        current_page: Some(current_page),
        request_id: None,
    })
}

fn new_user(id: i64) -> ServerEvent {
    ServerEvent::NewUserRequest(UserPage {
        users: Some(vec![record(id)]),
        ..Default::default()
    })
}

async fn expect_fetch(server: &mut ServerHandle) -> PageQuery {
    let event = tokio::time::timeout(common::WAIT, server.next_event())
        .await
        .expect("no fetch emitted")
        .expect("channel closed");
    match event {
        ClientEvent::GetRequestedUserLevel2(query) | ClientEvent::GetRequestedVehicles(query) => query,
        other => panic!("unexpected client event {:?}", other),
    }
}

/// User sync settled on page 1 with users 1..=5 out of 3 pages
async fn settled_user_sync(rig: &mut ChannelRig) -> (UserRequestSync, ServerHandle) {
    let sync = UserRequestSync::activate(rig.manager.clone(), 5, 1).await;
    let mut server = rig.next_session().await;
    expect_fetch(&mut server).await;

    server.push(user_page(1..=5, 3, 1));
    let mut rx = sync.watch();
    wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled).await;
    (sync, server)
}

#[tokio::test]
async fn test_first_page_fetch_and_settle() {
    common::init_tracing();
    let mut rig = ChannelRig::new(Some("access-1"));

    let sync = UserRequestSync::activate(rig.manager.clone(), 5, 1).await;
    let state = sync.state();
    assert!(state.loading);
    assert_eq!(state.phase, SyncPhase::AwaitingServer);

    let mut server = rig.next_session().await;
    let query = expect_fetch(&mut server).await;
    assert_eq!((query.page, query.limit), (1, 5));
    assert_eq!(query.request_id, Some(sync.latest_request()));
    assert!(server.try_next_event().is_none());

    server.push(user_page(1..=5, 3, 1));

    let mut rx = sync.watch();
    let state = wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled).await;
    assert_eq!(state.ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(state.total_pages, 3);
    assert_eq!(state.current_page, 1);
    assert!(!state.loading);
}

#[tokio::test]
async fn test_new_request_is_prepended_without_truncation() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (sync, server) = settled_user_sync(&mut rig).await;

    server.push(new_user(6));

    let mut rx = sync.watch();
    let state = wait_for_state(&mut rx, |s| s.items.len() == 6).await;
    assert_eq!(state.ids(), vec![6, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_new_request_ignored_off_first_page() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (mut sync, mut server) = settled_user_sync(&mut rig).await;

    sync.set_page(2).await.unwrap();
    assert_eq!(expect_fetch(&mut server).await.page, 2);
    server.push(user_page(6..=10, 3, 2));

    let mut rx = sync.watch();
    wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled && s.current_page == 2).await;

    server.push(new_user(99));
    // Events are dispatched in order, so once 7 is gone the push was handled too
    server.push(ServerEvent::DecisionUserLevel2(UserDecision { user_id: 7 }));
    let state = wait_for_state(&mut rx, |s| !s.contains(7)).await;

    assert!(!state.contains(99));
    assert_eq!(state.ids(), vec![6, 8, 9, 10]);
}

#[tokio::test]
async fn test_decision_push_removes_item() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (sync, server) = settled_user_sync(&mut rig).await;

    server.push(ServerEvent::DecisionUserLevel2(UserDecision { user_id: 3 }));

    let mut rx = sync.watch();
    let state = wait_for_state(&mut rx, |s| !s.contains(3)).await;
    assert_eq!(state.ids(), vec![1, 2, 4, 5]);
    assert_eq!(state.phase, SyncPhase::Settled);
}

#[tokio::test]
async fn test_optimistic_removal() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (sync, _server) = settled_user_sync(&mut rig).await;

    let before = sync.state();
    assert!(!sync.remove(42));
    assert_eq!(sync.state(), before);

    assert!(sync.remove(2));
    assert_eq!(sync.state().ids(), vec![1, 3, 4, 5]);
    assert!(!sync.remove(2));
}

#[tokio::test]
async fn test_each_page_change_emits_one_fetch_and_swaps_subscriptions() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (mut sync, mut server) = settled_user_sync(&mut rig).await;
    let channel = rig.manager.acquire().await.unwrap();

    for page in [2, 3, 1] {
        sync.set_page(page).await.unwrap();

        let query = expect_fetch(&mut server).await;
        assert_eq!(query.page, page);
        assert!(server.try_next_event().is_none());

        assert_eq!(channel.listener_count(EventKind::RequestedUserLevel2), 1);
        assert_eq!(channel.listener_count(EventKind::NewUserRequest), 1);
        assert_eq!(channel.listener_count(EventKind::DecisionUserLevel2), 1);

        let first = (page as i64 - 1) * 5 + 1;
        server.push(user_page(first..first + 5, 3, page));
        let mut rx = sync.watch();
        let state = wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled && s.current_page == page).await;
        assert_eq!(state.items.first().map(|r| r.id), Some(first));
    }

    assert_eq!(rig.connector.connection_count(), 1);

    drop(sync);
    assert_eq!(channel.listener_count(EventKind::RequestedUserLevel2), 0);
    assert_eq!(channel.listener_count(EventKind::NewUserRequest), 0);
    assert_eq!(channel.listener_count(EventKind::DecisionUserLevel2), 0);
}

#[tokio::test]
async fn test_stale_responses_are_discarded() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (mut sync, mut server) = settled_user_sync(&mut rig).await;

    sync.set_page(2).await.unwrap();
    let abandoned = expect_fetch(&mut server).await;
    sync.set_page(3).await.unwrap();
    let latest = expect_fetch(&mut server).await;
    assert!(latest.request_id > abandoned.request_id);

    // Late answer for page 2, then one echoing the abandoned request id
    server.push(user_page(6..=10, 3, 2));
    server.push(ServerEvent::RequestedUserLevel2(UserPage {
        users: Some(records(20..=21)),
        total_pages: Some(9),
        current_page: None,
        request_id: abandoned.request_id,
    }));
    server.push(ServerEvent::RequestedUserLevel2(UserPage {
        users: Some(records(11..=15)),
        total_pages: Some(3),
        current_page: Some(3),
        request_id: latest.request_id,
    }));

    let mut rx = sync.watch();
    let state = wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled).await;
    assert_eq!(state.current_page, 3);
    assert_eq!(state.ids(), vec![11, 12, 13, 14, 15]);
    assert_eq!(state.total_pages, 3);
}

#[tokio::test]
async fn test_connection_failure_sets_error() {
    let rig = ChannelRig::new(Some("access-1"));
    rig.connector.set_refusing(true);

    let sync = UserRequestSync::activate(rig.manager.clone(), 5, 1).await;
    let state = sync.state();
    assert!(!state.loading);
    assert_eq!(state.phase, SyncPhase::Idle);
    assert!(state.error.unwrap().contains("refused"));
}

#[tokio::test]
async fn test_vehicle_page_push_and_decision() {
    let mut rig = ChannelRig::new(Some("access-1"));

    let mut sync = VehicleRequestSync::activate(rig.manager.clone(), 5, 1).await;
    let mut server = rig.next_session().await;
    let query = expect_fetch(&mut server).await;
    assert_eq!(query.page, 1);

    server.push(ServerEvent::RequestedVehicles(VehiclePage {
        vehicles: Some(records([10, 11])),
        total_pages: Some(2),
        current_page: Some(1),
        request_id: query.request_id,
    }));
    let mut rx = sync.watch();
    wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled).await;

    server.push(ServerEvent::NewVehicleRequest(VehiclePage {
        vehicles: Some(vec![record(12)]),
        ..Default::default()
    }));
    let state = wait_for_state(&mut rx, |s| s.contains(12)).await;
    assert_eq!(state.ids(), vec![12, 10, 11]);

    server.push(ServerEvent::DecisionVehicle(VehicleDecision { vehicle_id: 10 }));
    let state = wait_for_state(&mut rx, |s| !s.contains(10)).await;
    assert_eq!(state.ids(), vec![12, 11]);

    // A single-vehicle last page is still a page, not a push
    sync.set_page(2).await.unwrap();
    let query = expect_fetch(&mut server).await;
    server.push(ServerEvent::RequestedVehicles(VehiclePage {
        vehicles: Some(vec![record(30)]),
        total_pages: None,
        current_page: Some(2),
        request_id: query.request_id,
    }));
    let state = wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled && s.current_page == 2).await;
    assert_eq!(state.ids(), vec![30]);
    assert_eq!(state.total_pages, 2);
}

#[tokio::test]
async fn test_repeated_push_does_not_duplicate() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (sync, server) = settled_user_sync(&mut rig).await;

    server.push(new_user(4));

    let mut rx = sync.watch();
    let state = wait_for_state(&mut rx, |s| s.items.first().map(|r| r.id) == Some(4)).await;
    assert_eq!(state.ids(), vec![4, 1, 2, 3, 5]);
}

#[tokio::test]
async fn test_subscriptions_follow_reconnects() {
    common::init_tracing();
    let mut rig = ChannelRig::new(Some("access-1"));
    let (sync, server) = settled_user_sync(&mut rig).await;

    server.disconnect("transport close");
    tokio::time::timeout(common::WAIT, async {
        while rig.manager.is_connected().await {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("manager never noticed the disconnect");

    let channel = rig.manager.acquire().await.unwrap();
    let server = rig.next_session().await;
    assert_eq!(rig.connector.connection_count(), 2);
    assert_eq!(channel.listener_count(EventKind::DecisionUserLevel2), 1);

    server.push(ServerEvent::DecisionUserLevel2(UserDecision { user_id: 3 }));
    server.push(new_user(6));

    let mut rx = sync.watch();
    let state = wait_for_state(&mut rx, |s| !s.contains(3) && s.contains(6)).await;
    assert_eq!(state.ids(), vec![6, 1, 2, 4, 5]);
    assert_eq!(state.error, None);
}

#[tokio::test]
async fn test_echoed_request_settles_on_server_page() {
    let mut rig = ChannelRig::new(Some("access-1"));
    let (mut sync, mut server) = settled_user_sync(&mut rig).await;

    // Past the end: the server answers with its last page instead
    sync.set_page(7).await.unwrap();
    let query = expect_fetch(&mut server).await;
    server.push(ServerEvent::RequestedUserLevel2(UserPage {
        users: Some(records(11..=13)),
        total_pages: Some(3),
        current_page: Some(3),
        request_id: query.request_id,
    }));

    let mut rx = sync.watch();
    let state = wait_for_state(&mut rx, |s| s.phase == SyncPhase::Settled).await;
    assert!(!state.loading);
    assert_eq!(state.current_page, 3);
    assert_eq!(state.ids(), vec![11, 12, 13]);
}

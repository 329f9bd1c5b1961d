use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tillpulse_core::events::{DashboardEvent, RoomEvent};
use tillpulse_core::listener::{
    ChangeEvent, ChangeKind, ChannelFeed, ListenerConfig, DATASET_ALERTS, DATASET_TRANSACTIONS,
};
use tillpulse_core::model::DependencyState;
use tillpulse_core::{Engine, MemoryStore, MetricsStore, RetryPolicy};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const ROOM: &str = "admin-dashboard";

fn test_config() -> ListenerConfig {
    ListenerConfig {
        rooms: vec![ROOM.to_string()],
        debounce: Duration::from_millis(100),
        subscribe_timeout: Duration::from_secs(1),
        retry: RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(100)),
        error_after_attempts: 2,
    }
}

fn engine() -> (Engine, Arc<MemoryStore>, Arc<ChannelFeed>) {
    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(ChannelFeed::new());
    let engine = Engine::new(store.clone(), feed.clone(), test_config());
    (engine, store, feed)
}

fn transaction_change(id: &str, total: f64, kind: ChangeKind) -> ChangeEvent {
    ChangeEvent {
        dataset: DATASET_TRANSACTIONS.to_string(),
        kind,
        record: json!({
            "id": id,
            "created_at": Utc::now(),
            "total": total,
            "payment_method": "cash",
            "cashier_id": "cashier-1",
            "status": "completed",
        }),
    }
}

/// The feed rejects pushes until the listener has subscribed; the tests
/// spin briefly instead of racing the spawn.
async fn push_when_subscribed(feed: &ChannelFeed, event: ChangeEvent) {
    for _ in 0..100 {
        match feed.push(event.clone()).await {
            Ok(()) => return,
            Err(_) => sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("listener never subscribed");
}

async fn recv(rx: &mut mpsc::Receiver<RoomEvent>) -> RoomEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Applies the change to the store (as the upstream source of truth would)
/// and then pushes it onto the feed.
async fn ingest(store: &MemoryStore, feed: &ChannelFeed, change: ChangeEvent) {
    store.record_change(&change).await.expect("record change");
    push_when_subscribed(feed, change).await;
}

#[tokio::test]
async fn insert_broadcasts_transaction_then_debounced_kpi_update() {
    let (mut engine, store, feed) = engine();
    engine.start();

    let mut rx = engine.hub.join(ROOM, "sess");
    recv(&mut rx).await; // sync

    ingest(&store, &feed, transaction_change("t1", 50.0, ChangeKind::Insert)).await;

    // The raw broadcast may interleave with the connected status event.
    let mut saw_transaction = false;
    let mut kpi = None;
    while kpi.is_none() {
        let event = recv(&mut rx).await;
        match event.event {
            DashboardEvent::NewTransaction { transaction } => {
                assert_eq!(transaction.id, "t1");
                assert_eq!(transaction.total, 50.0);
                saw_transaction = true;
            }
            DashboardEvent::KpiUpdate { snapshot } => kpi = Some(snapshot),
            DashboardEvent::SystemStatus { .. } => {}
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }
    assert!(saw_transaction, "insert must broadcast before the recompute");

    let snapshot = kpi.expect("kpi update");
    assert_eq!(snapshot.revenue, 50.0);
    assert_eq!(snapshot.transaction_count, 1);
    assert_eq!(snapshot.average_order_value, 50.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn rapid_updates_coalesce_into_one_recompute() {
    let (mut engine, store, feed) = engine();
    engine.start();

    let mut rx = engine.hub.join(ROOM, "sess");
    recv(&mut rx).await; // sync

    // Updates inside one debounce window; none broadcasts raw, all collapse
    // into a single recompute.
    for total in [10.0, 20.0, 30.0, 40.0, 50.0] {
        ingest(
            &store,
            &feed,
            transaction_change("t1", total, ChangeKind::Update),
        )
        .await;
    }

    let mut kpi_updates = 0;
    loop {
        match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(event)) => match event.event {
                DashboardEvent::KpiUpdate { snapshot } => {
                    kpi_updates += 1;
                    assert_eq!(snapshot.revenue, 50.0);
                }
                DashboardEvent::SystemStatus { .. } => {}
                other => panic!("unexpected event {:?}", other.kind()),
            },
            _ => break,
        }
    }
    assert_eq!(kpi_updates, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn active_alerts_are_relayed_inactive_ones_are_not() {
    let (mut engine, store, feed) = engine();
    engine.start();

    let mut rx = engine.hub.join(ROOM, "sess");
    recv(&mut rx).await; // sync

    let inactive = ChangeEvent {
        dataset: DATASET_ALERTS.to_string(),
        kind: ChangeKind::Update,
        record: json!({
            "id": "resolved",
            "title": "restocked",
            "message": "milk restocked",
            "severity": "low",
            "is_active": false,
            "created_at": Utc::now(),
        }),
    };
    let active = ChangeEvent {
        dataset: DATASET_ALERTS.to_string(),
        kind: ChangeKind::Insert,
        record: json!({
            "id": "low-stock",
            "title": "low stock",
            "message": "milk below threshold",
            "severity": "high",
            "is_active": true,
            "created_at": Utc::now(),
        }),
    };
    ingest(&store, &feed, inactive).await;
    ingest(&store, &feed, active).await;

    loop {
        let event = recv(&mut rx).await;
        match event.event {
            DashboardEvent::Alert { alert } => {
                assert_eq!(alert.id, "low-stock");
                break;
            }
            DashboardEvent::SystemStatus { .. } => {}
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn listener_resubscribes_after_the_feed_drops() {
    let (mut engine, store, feed) = engine();
    engine.start();

    let mut rx = engine.hub.join(ROOM, "sess");
    recv(&mut rx).await; // sync

    ingest(&store, &feed, transaction_change("t1", 10.0, ChangeKind::Insert)).await;
    loop {
        if matches!(recv(&mut rx).await.event, DashboardEvent::NewTransaction { .. }) {
            break;
        }
    }

    feed.disconnect().await;

    // The ended stream degrades the feed, then the resubscribe restores it.
    loop {
        let event = recv(&mut rx).await;
        if let DashboardEvent::SystemStatus { status } = event.event {
            let state = status
                .dependencies
                .get("change-feed")
                .expect("tracked")
                .state;
            if state == DependencyState::Degraded {
                break;
            }
        }
    }
    loop {
        let event = recv(&mut rx).await;
        if let DashboardEvent::SystemStatus { status } = event.event {
            let state = status
                .dependencies
                .get("change-feed")
                .expect("tracked")
                .state;
            if state == DependencyState::Connected {
                break;
            }
        }
    }

    // Events flow again on the new stream.
    ingest(&store, &feed, transaction_change("t2", 20.0, ChangeKind::Insert)).await;
    loop {
        let event = recv(&mut rx).await;
        if let DashboardEvent::NewTransaction { transaction } = event.event {
            assert_eq!(transaction.id, "t2");
            break;
        }
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_pending_recomputes() {
    let (mut engine, store, feed) = engine();
    engine.start();

    let mut rx = engine.hub.join(ROOM, "sess");
    recv(&mut rx).await; // sync

    ingest(&store, &feed, transaction_change("t1", 50.0, ChangeKind::Insert)).await;
    // Shut down inside the debounce window; the scheduled recompute must
    // not fire afterwards.
    engine.shutdown().await;

    let mut saw_kpi = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), rx.recv()).await {
        if matches!(event.event, DashboardEvent::KpiUpdate { .. }) {
            saw_kpi = true;
        }
    }
    assert!(!saw_kpi, "recompute fired after shutdown");
    assert_eq!(engine.hub.session_count(), 0);
}

#[tokio::test]
async fn start_is_idempotent() {
    let (mut engine, _store, feed) = engine();
    engine.start();
    engine.start();

    // Exactly one listener consumes the feed; a second one would steal the
    // subscription and break the push below.
    push_when_subscribed(&feed, transaction_change("t1", 5.0, ChangeKind::Insert)).await;

    engine.shutdown().await;
}

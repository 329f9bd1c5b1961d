// Change stream listener
//
// Consumes insert/update events from the transaction and alert data sets,
// decides per event between an immediate broadcast and a debounced KPI
// recompute, and keeps the health monitor informed about the feed
// connection. A failed subscription is retried with backoff forever; it is
// surfaced through SystemStatus, never silently dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::backoff::RetryPolicy;
use crate::events::DashboardEvent;
use crate::health::{HealthMonitor, CHANGE_FEED};
use crate::hub::BroadcastHub;
use crate::model::{Alert, DateRange, DependencyState, Transaction};
use crate::period;
use crate::store::MetricsStore;
use crate::{PulseError, Result};

/// Data sets watched on the change feed.
pub const DATASET_TRANSACTIONS: &str = "transactions";
pub const DATASET_ALERTS: &str = "alerts";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// One record change as emitted by the upstream feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub dataset: String,
    #[serde(rename = "event")]
    pub kind: ChangeKind,
    pub record: serde_json::Value,
}

/// Opaque push source of change events. `subscribe` is called again after
/// every stream failure; each call yields a fresh stream.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChangeEvent>>;
}

/// In-process [`ChangeFeed`] fed by `push`. The gateway's ingest endpoint
/// and the tests drive the listener through this.
pub struct ChannelFeed {
    capacity: usize,
    sender: RwLock<Option<mpsc::Sender<ChangeEvent>>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self {
            capacity: 256,
            sender: RwLock::new(None),
        }
    }

    /// Forwards a change event to the current subscriber.
    pub async fn push(&self, event: ChangeEvent) -> Result<()> {
        let tx = self.sender.read().await.clone();
        match tx {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| PulseError::StreamSubscription("feed subscriber went away".into())),
            None => Err(PulseError::StreamSubscription(
                "feed has no active subscriber".into(),
            )),
        }
    }

    /// Ends the current stream, forcing the listener through its
    /// resubscription path.
    pub async fn disconnect(&self) {
        *self.sender.write().await = None;
    }
}

impl Default for ChannelFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.sender.write().await = Some(tx);
        Ok(rx)
    }
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Rooms that receive broadcasts and scheduled recomputes.
    pub rooms: Vec<String>,
    /// Trailing-edge debounce window per room: triggers landing inside it
    /// collapse into a single recompute.
    pub debounce: Duration,
    /// A subscribe attempt that neither confirms nor errors within this
    /// interval is treated as failed.
    pub subscribe_timeout: Duration,
    pub retry: RetryPolicy,
    /// Consecutive failures before the feed is reported as `error` rather
    /// than `degraded`. Retrying continues regardless.
    pub error_after_attempts: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            rooms: vec!["admin-dashboard".to_string()],
            debounce: Duration::from_secs(2),
            subscribe_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            error_after_attempts: 5,
        }
    }
}

pub struct ChangeStreamListener {
    hub: Arc<BroadcastHub>,
    health: Arc<HealthMonitor>,
    store: Arc<dyn MetricsStore>,
    feed: Arc<dyn ChangeFeed>,
    config: ListenerConfig,
    // Rooms with a recompute already scheduled; the debounce key is the
    // room, not the individual transaction.
    pending: DashMap<String, ()>,
    undecodable: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl ChangeStreamListener {
    pub fn new(
        hub: Arc<BroadcastHub>,
        health: Arc<HealthMonitor>,
        store: Arc<dyn MetricsStore>,
        feed: Arc<dyn ChangeFeed>,
        config: ListenerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            hub,
            health,
            store,
            feed,
            config,
            pending: DashMap::new(),
            undecodable: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Records that could not be decoded off the feed (logged and skipped).
    pub fn undecodable_records(&self) -> u64 {
        self.undecodable.load(Ordering::Relaxed)
    }

    /// Subscribe-consume-resubscribe loop. Runs until shutdown is signalled.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match timeout(self.config.subscribe_timeout, self.feed.subscribe()).await {
                Ok(Ok(mut rx)) => {
                    failures = 0;
                    self.health.report(CHANGE_FEED, DependencyState::Connected);
                    info!(target: "listener", "subscribed to change feed");

                    let stream_ended = loop {
                        tokio::select! {
                            maybe = rx.recv() => match maybe {
                                Some(event) => Self::handle_event(&self, event).await,
                                None => break true,
                            },
                            _ = shutdown.changed() => break false,
                        }
                    };
                    if !stream_ended {
                        break;
                    }
                    warn!(target: "listener", "change feed stream ended");
                }
                Ok(Err(e)) => {
                    warn!(target: "listener", error = %e, "change feed subscribe failed");
                }
                Err(_) => {
                    warn!(
                        target: "listener",
                        timeout_ms = self.config.subscribe_timeout.as_millis() as u64,
                        "change feed subscribe timed out"
                    );
                }
            }

            failures += 1;
            let state = if failures >= self.config.error_after_attempts {
                DependencyState::Error
            } else {
                DependencyState::Degraded
            };
            self.health.report(CHANGE_FEED, state);

            let delay = self.config.retry.delay(failures.saturating_sub(1));
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(target: "listener", "change stream listener stopped");
    }

    async fn handle_event(listener: &Arc<Self>, change: ChangeEvent) {
        match change.dataset.as_str() {
            DATASET_TRANSACTIONS => match change.kind {
                ChangeKind::Insert => match serde_json::from_value::<Transaction>(change.record) {
                    Ok(tx) => {
                        // New transactions are broadcast immediately; the
                        // aggregate catches up via the debounced recompute.
                        for room in &listener.config.rooms {
                            listener.hub.publish(
                                room,
                                DashboardEvent::NewTransaction {
                                    transaction: tx.clone(),
                                },
                            );
                            Self::schedule_recompute(listener, room);
                        }
                    }
                    Err(e) => listener.note_undecodable(DATASET_TRANSACTIONS, &e),
                },
                ChangeKind::Update => {
                    // Corrections change aggregates but are not "new" events
                    // worth a raw broadcast.
                    for room in &listener.config.rooms {
                        Self::schedule_recompute(listener, room);
                    }
                }
            },
            DATASET_ALERTS => match serde_json::from_value::<Alert>(change.record) {
                Ok(alert) if alert.is_active => {
                    for room in &listener.config.rooms {
                        listener.hub.publish(
                            room,
                            DashboardEvent::Alert {
                                alert: alert.clone(),
                            },
                        );
                    }
                }
                Ok(_) => {
                    // Deactivations reach clients through the polling path.
                }
                Err(e) => listener.note_undecodable(DATASET_ALERTS, &e),
            },
            other => {
                debug!(target: "listener", dataset = %other, "ignoring change for unwatched dataset");
            }
        }
    }

    /// Schedules a debounced recompute for a room. A second trigger while
    /// one is pending is absorbed; the recompute ticket is taken at fire
    /// time so the hub's last-write-wins resolves out-of-order completions.
    fn schedule_recompute(listener: &Arc<Self>, room: &str) {
        use dashmap::mapref::entry::Entry;
        match listener.pending.entry(room.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }

        let listener = Arc::clone(listener);
        let room = room.to_string();
        let mut shutdown = listener.shutdown.clone();
        tokio::spawn(async move {
            // `changed()` only observes sends after the clone above; a
            // shutdown that landed before it is caught here.
            if *shutdown.borrow() {
                listener.pending.remove(&room);
                return;
            }
            tokio::select! {
                _ = sleep(listener.config.debounce) => {}
                _ = shutdown.changed() => {
                    listener.pending.remove(&room);
                    return;
                }
            }
            listener.pending.remove(&room);

            let ticket = listener.hub.begin_recompute(&room);
            if let Err(e) = listener.recompute(&room, ticket).await {
                warn!(target: "listener", room = %room, error = %e, "kpi recompute failed");
            }
        });
    }

    async fn recompute(&self, room: &str, ticket: u64) -> Result<()> {
        let window = period::today_window(Utc::now());
        let periods = period::compute_range(window.start, window.end)?;
        // One fetch covers both windows; the aggregator re-filters.
        let fetch_range = DateRange {
            start: periods.previous.start,
            end: periods.current.end,
        };
        let transactions = self.store.fetch_transactions(&fetch_range, None).await?;
        let snapshot = aggregate::aggregate(&transactions, &window)?;
        self.hub.publish_kpi(room, snapshot, ticket);
        Ok(())
    }

    fn note_undecodable(&self, dataset: &str, error: &serde_json::Error) {
        self.undecodable.fetch_add(1, Ordering::Relaxed);
        warn!(target: "listener", dataset = %dataset, error = %error, "skipping undecodable record");
    }
}

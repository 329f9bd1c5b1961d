// Connection manager for dashboard clients
//
// Owns two loops: a push loop that keeps the event stream connected with
// exponential backoff, and a poll loop that refreshes the full snapshot on
// a fixed interval regardless of push health. Either path alone keeps the
// dashboard usable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use tillpulse_core::events::DashboardEvent;
use tillpulse_core::model::{Alert, KpiSnapshot, SystemStatus, Transaction};
use tillpulse_core::RetryPolicy;

use crate::Result;

const RECENT_TRANSACTIONS_KEPT: usize = 50;

/// Where the push channel currently stands. A linear machine
/// (disconnected, connecting, connected, back to disconnected on close);
/// it only stops cycling at explicit teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Push side of the gateway connection. `connect` is called again after
/// every stream failure; a closed receiver means the stream ended.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<mpsc::Receiver<DashboardEvent>>;
}

/// Pull side: one full snapshot per call, used as the fallback refresh.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn snapshot(&self) -> Result<DashboardSnapshot>;
}

/// Everything a dashboard renders, merged from both channels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub kpis: Option<KpiSnapshot>,
    pub transactions: Vec<Transaction>,
    pub alerts: Vec<Alert>,
    pub status: SystemStatus,
}

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    pub retry: RetryPolicy,
    /// Fallback poll cadence; independent of push-channel health.
    pub poll_interval: Duration,
    /// Buffered live events handed to the consumer. Overflowing events are
    /// dropped; the merged snapshot stays authoritative either way.
    pub event_buffer: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

/// Handle over the running loops. Dropping it without calling
/// [`shutdown`](ReconnectManager::shutdown) aborts nothing; the loops stop
/// once their channels close.
pub struct ReconnectManager {
    state: watch::Receiver<ConnectionState>,
    snapshot: watch::Receiver<DashboardSnapshot>,
    events: mpsc::Receiver<DashboardEvent>,
    shutdown: watch::Sender<bool>,
    push_handle: JoinHandle<()>,
    poll_handle: JoinHandle<()>,
}

impl ReconnectManager {
    pub fn start(
        transport: Arc<dyn PushTransport>,
        poll: Arc<dyn PollSource>,
        config: ReconnectConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (snapshot_tx, snapshot_rx) = watch::channel(DashboardSnapshot::default());
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let snapshot_for_push = snapshot_tx.clone();
        let push_shutdown = shutdown_rx.clone();
        let retry = config.retry;
        let push_handle = tokio::spawn(push_loop(
            transport,
            retry,
            state_tx,
            snapshot_for_push,
            events_tx,
            push_shutdown,
        ));

        let poll_handle = tokio::spawn(poll_loop(
            poll,
            config.poll_interval,
            snapshot_tx,
            shutdown_rx,
        ));

        Self {
            state: state_rx,
            snapshot: snapshot_rx,
            events: events_rx,
            shutdown: shutdown_tx,
            push_handle,
            poll_handle,
        }
    }

    /// Current push-channel state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch handle for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Latest merged snapshot; updated by both live events and polls.
    pub fn snapshot(&self) -> DashboardSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<DashboardSnapshot> {
        self.snapshot.clone()
    }

    /// Next live event off the push channel. `None` after shutdown.
    pub async fn next_event(&mut self) -> Option<DashboardEvent> {
        self.events.recv().await
    }

    /// Stops both loops and waits for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.push_handle.await;
        let _ = self.poll_handle.await;
        info!(target: "client", "connection manager stopped");
    }
}

async fn push_loop(
    transport: Arc<dyn PushTransport>,
    retry: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    snapshot: watch::Sender<DashboardSnapshot>,
    events: mpsc::Sender<DashboardEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let _ = state.send(ConnectionState::Connecting);

        match transport.connect().await {
            Ok(mut rx) => {
                attempt = 0;
                let _ = state.send(ConnectionState::Connected);
                info!(target: "client", "push channel connected");

                let stream_ended = loop {
                    tokio::select! {
                        maybe = rx.recv() => match maybe {
                            Some(event) => {
                                apply_event(&snapshot, &event);
                                // A consumer that stopped reading does not
                                // stall the snapshot merge.
                                if events.try_send(event).is_err() {
                                    debug!(target: "client", "event buffer full, consumer lagging");
                                }
                            }
                            None => break true,
                        },
                        _ = shutdown.changed() => break false,
                    }
                };
                if !stream_ended {
                    break;
                }
                warn!(target: "client", "push channel closed");
            }
            Err(e) => {
                warn!(target: "client", error = %e, "push channel connect failed");
            }
        }

        let _ = state.send(ConnectionState::Disconnected);
        let delay = retry.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn poll_loop(
    poll: Arc<dyn PollSource>,
    poll_interval: Duration,
    snapshot: watch::Sender<DashboardSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match poll.snapshot().await {
            Ok(fresh) => {
                snapshot.send_replace(fresh);
                debug!(target: "client", "snapshot refreshed via poll");
            }
            Err(e) => {
                warn!(target: "client", error = %e, "poll failed");
            }
        }
    }
}

/// Merges one live event into the rendered snapshot. Merging is idempotent
/// per record id, so a replayed delivery changes nothing.
fn apply_event(snapshot: &watch::Sender<DashboardSnapshot>, event: &DashboardEvent) {
    match event {
        DashboardEvent::KpiUpdate { snapshot: kpis } => {
            snapshot.send_modify(|s| s.kpis = Some(kpis.clone()));
        }
        DashboardEvent::NewTransaction { transaction } => {
            snapshot.send_modify(|s| {
                s.transactions.retain(|tx| tx.id != transaction.id);
                s.transactions.insert(0, transaction.clone());
                s.transactions.truncate(RECENT_TRANSACTIONS_KEPT);
            });
        }
        DashboardEvent::Alert { alert } => {
            snapshot.send_modify(|s| {
                s.alerts.retain(|a| a.id != alert.id);
                s.alerts.insert(0, alert.clone());
            });
        }
        DashboardEvent::SystemStatus { status } => {
            snapshot.send_modify(|s| s.status = status.clone());
        }
        DashboardEvent::Sync { snapshot: kpis, status } => {
            snapshot.send_modify(|s| {
                if kpis.is_some() {
                    s.kpis = kpis.clone();
                }
                s.status = status.clone();
            });
        }
    }
}

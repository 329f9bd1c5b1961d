// TillPulse Core Library
// Real-time retail KPI aggregation and broadcast engine

pub mod aggregate;
pub mod backoff;
pub mod events;
pub mod health;
pub mod hub;
pub mod listener;
pub mod model;
pub mod period;
pub mod store;

// Export core types
pub use backoff::RetryPolicy;
pub use events::{DashboardEvent, RoomEvent};
pub use health::{HealthMonitor, CHANGE_FEED};
pub use hub::{BroadcastHub, HubStats};
pub use listener::{
    ChangeEvent, ChangeFeed, ChangeKind, ChangeStreamListener, ChannelFeed, ListenerConfig,
};
pub use model::{
    Alert, AlertSeverity, DateRange, DependencyHealth, DependencyState, KpiSnapshot, LineItem,
    PaymentMethod, PaymentMix, PeriodPair, SystemStatus, Transaction, TransactionStatus,
};
pub use store::{MemoryStore, MetricsStore};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("invalid date range: {0}")]
    InvalidRange(String),

    #[error("stream subscription error: {0}")]
    StreamSubscription(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("aggregation error: {0}")]
    Aggregation(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PulseError>;

/// Core runtime: wires the broadcast hub, health monitor, store and
/// change-stream listener together and owns their lifecycle.
pub struct Engine {
    pub hub: Arc<BroadcastHub>,
    pub health: Arc<HealthMonitor>,
    pub store: Arc<dyn MetricsStore>,
    listener: Arc<ChangeStreamListener>,
    shutdown: watch::Sender<bool>,
    listener_handle: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        feed: Arc<dyn ChangeFeed>,
        config: ListenerConfig,
    ) -> Self {
        let hub = Arc::new(BroadcastHub::new());
        let health = Arc::new(HealthMonitor::new(hub.clone(), config.rooms.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = Arc::new(ChangeStreamListener::new(
            hub.clone(),
            health.clone(),
            store.clone(),
            feed,
            config,
            shutdown_rx,
        ));

        Self {
            hub,
            health,
            store,
            listener,
            shutdown,
            listener_handle: None,
        }
    }

    /// Spawns the change-stream listener. Idempotent.
    pub fn start(&mut self) {
        if self.listener_handle.is_some() {
            return;
        }
        tracing::info!("Starting TillPulse engine");
        let listener = Arc::clone(&self.listener);
        self.listener_handle = Some(tokio::spawn(listener.run()));
        tracing::info!("TillPulse engine started");
    }

    /// Signals the listener (and its pending debounce timers) to stop, waits
    /// for the run loop to exit, and drops all rooms.
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down TillPulse engine");
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.await;
        }
        self.hub.clear();
        tracing::info!("TillPulse engine shut down");
    }
}

// Broadcast event types
//
// A closed tagged union: every consumer can exhaustively handle all kinds
// instead of pattern-matching an open-ended object bag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Alert, KpiSnapshot, SystemStatus, Transaction};

/// Event payload fanned out to dashboard sessions.
///
/// `Sync` is delivered exactly once, to a single session, at join time; the
/// other four kinds are room-wide broadcasts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DashboardEvent {
    NewTransaction {
        transaction: Transaction,
    },
    KpiUpdate {
        snapshot: KpiSnapshot,
    },
    Alert {
        alert: Alert,
    },
    SystemStatus {
        status: SystemStatus,
    },
    /// Join-time catch-up so a mid-stream joiner never starts stale.
    Sync {
        snapshot: Option<KpiSnapshot>,
        status: SystemStatus,
    },
}

impl DashboardEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DashboardEvent::NewTransaction { .. } => "new-transaction",
            DashboardEvent::KpiUpdate { .. } => "kpi-update",
            DashboardEvent::Alert { .. } => "alert",
            DashboardEvent::SystemStatus { .. } => "system-status",
            DashboardEvent::Sync { .. } => "sync",
        }
    }
}

/// A [`DashboardEvent`] as delivered to a session: stamped with the room,
/// a per-room sequence number, and a monotonically non-decreasing
/// observed-at timestamp so receivers can discard stale deliveries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub room: String,
    pub seq: u64,
    pub observed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DashboardEvent,
}

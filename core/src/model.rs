// Domain model for the KPI engine
//
// Transactions and alerts are created by the point-of-sale flow and only
// observed here; KPI snapshots and system status are derived, ephemeral
// records owned by this crate.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How a customer paid. Unknown methods coming off the change feed are
/// folded into `Other` rather than rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    Cash,
    MobileMoney,
    Card,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// A single line on a receipt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

/// Immutable business event emitted by the point-of-sale flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub total: f64,
    pub payment_method: PaymentMethod,
    pub cashier_id: String,
    #[serde(default)]
    pub items: Vec<LineItem>,
    pub status: TransactionStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

/// Operational alert raised outside the core; the engine only relays it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Half-open in spirit, inclusive in practice: a transaction whose
/// `created_at` equals either bound is inside the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

/// Current window plus the immediately preceding window of equal duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodPair {
    pub current: DateRange,
    pub previous: DateRange,
}

/// Share of completed transactions per payment method, as percentages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PaymentMix {
    pub cash: f64,
    pub mobile_money: f64,
    pub card: f64,
    pub other: f64,
}

/// Fully-recomputed metrics for one window, with period-over-period deltas.
///
/// All currency and percentage figures are rounded to 2 decimal places at
/// this boundary; internal computation runs at full precision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub window: DateRange,
    pub revenue: f64,
    pub revenue_change_pct: f64,
    pub transaction_count: u64,
    pub count_change_pct: f64,
    pub average_order_value: f64,
    pub aov_change_pct: f64,
    pub payment_method_pct: PaymentMix,
    /// Malformed records skipped during aggregation (either window).
    pub skipped_records: u64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyState {
    Connected,
    Degraded,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub state: DependencyState,
    pub changed_at: DateTime<Utc>,
}

/// Connectivity state of every watched upstream dependency.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub dependencies: HashMap<String, DependencyHealth>,
}

impl SystemStatus {
    /// Most recent state change across all dependencies, if any.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.dependencies.values().map(|d| d.changed_at).max()
    }
}

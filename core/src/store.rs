// Query interface to the transaction/alert data source
//
// The real data store is an external collaborator; the engine only needs a
// narrow read surface for recomputes and client fallback polls. MemoryStore
// is the in-process implementation used by tests and the default gateway
// wiring: it materializes records carried on the change feed.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::listener::{ChangeEvent, DATASET_ALERTS, DATASET_TRANSACTIONS};
use crate::model::{Alert, DateRange, Transaction, TransactionStatus};
use crate::Result;

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Transactions whose `created_at` falls within `range` (inclusive),
    /// optionally narrowed to one status.
    async fn fetch_transactions(
        &self,
        range: &DateRange,
        status: Option<TransactionStatus>,
    ) -> Result<Vec<Transaction>>;

    /// Most recent transactions, newest first.
    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>>;

    /// Alerts currently flagged active, newest first.
    async fn active_alerts(&self) -> Result<Vec<Alert>>;

    /// Applies a change-feed record to the store, if this store materializes
    /// feed data. External stores already hold the data and keep the default
    /// no-op.
    async fn record_change(&self, _change: &ChangeEvent) -> Result<()> {
        Ok(())
    }
}

/// DashMap-backed store keyed by record id. Inserts and updates are both
/// upserts; transactions are immutable apart from the status/amount
/// corrections observed via the change feed.
#[derive(Default)]
pub struct MemoryStore {
    transactions: DashMap<String, Transaction>,
    alerts: DashMap<String, Alert>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        self.transactions.insert(tx.id.clone(), tx);
    }

    pub fn insert_alert(&self, alert: Alert) {
        self.alerts.insert(alert.id.clone(), alert);
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn fetch_transactions(
        &self,
        range: &DateRange,
        status: Option<TransactionStatus>,
    ) -> Result<Vec<Transaction>> {
        let mut out: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|entry| range.contains(entry.created_at))
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.clone())
            .collect();
        out.sort_by_key(|tx| tx.created_at);
        Ok(out)
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        let mut out: Vec<Transaction> = self
            .transactions
            .iter()
            .map(|entry| entry.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn active_alerts(&self) -> Result<Vec<Alert>> {
        let mut out: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|entry| entry.is_active)
            .map(|entry| entry.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn record_change(&self, change: &ChangeEvent) -> Result<()> {
        match change.dataset.as_str() {
            DATASET_TRANSACTIONS => {
                let tx: Transaction = serde_json::from_value(change.record.clone())?;
                self.insert_transaction(tx);
            }
            DATASET_ALERTS => {
                let alert: Alert = serde_json::from_value(change.record.clone())?;
                self.insert_alert(alert);
            }
            other => {
                debug!(target: "store", dataset = %other, kind = ?change.kind, "ignoring change for unknown dataset");
            }
        }
        Ok(())
    }
}

// KPI aggregation over a date window
//
// Pure and idempotent: same transactions + same window always produce the
// same snapshot, so concurrent recomputes for different rooms are safe and
// a repeated recompute is harmless.

use chrono::Utc;
use tracing::debug;

use crate::model::{
    DateRange, KpiSnapshot, PaymentMethod, PaymentMix, Transaction, TransactionStatus,
};
use crate::{period, Result};

/// Totals for one window at full precision, before rounding.
#[derive(Debug, Default)]
struct WindowTotals {
    revenue: f64,
    count: u64,
    cash: u64,
    mobile_money: u64,
    card: u64,
    other: u64,
    skipped: u64,
}

impl WindowTotals {
    fn average_order_value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.revenue / self.count as f64
        }
    }

    fn mix(&self) -> PaymentMix {
        if self.count == 0 {
            return PaymentMix::default();
        }
        let pct = |n: u64| n as f64 / self.count as f64 * 100.0;
        PaymentMix {
            cash: pct(self.cash),
            mobile_money: pct(self.mobile_money),
            card: pct(self.card),
            other: pct(self.other),
        }
    }
}

/// Computes a [`KpiSnapshot`] for `window` from the given transactions.
///
/// Callers normally pre-filter via the data source, but the aggregator
/// re-validates defensively: only completed transactions whose `created_at`
/// falls inside the window count. Records with a non-finite or negative
/// total are skipped and tallied in `skipped_records` instead of aborting
/// the whole computation.
///
/// The previous window of equal duration is derived internally and feeds
/// the delta fields; transactions outside both windows are ignored.
pub fn aggregate(transactions: &[Transaction], window: &DateRange) -> Result<KpiSnapshot> {
    let periods = period::compute_range(window.start, window.end)?;

    let current = window_totals(transactions, &periods.current);
    let previous = window_totals(transactions, &periods.previous);

    if current.skipped + previous.skipped > 0 {
        debug!(
            target: "aggregate",
            skipped = current.skipped + previous.skipped,
            "skipped malformed transaction records"
        );
    }

    let mix = current.mix();
    Ok(KpiSnapshot {
        window: periods.current,
        revenue: round2(current.revenue),
        revenue_change_pct: round2(period::percent_change(current.revenue, previous.revenue)),
        transaction_count: current.count,
        count_change_pct: round2(period::percent_change(
            current.count as f64,
            previous.count as f64,
        )),
        average_order_value: round2(current.average_order_value()),
        aov_change_pct: round2(period::percent_change(
            current.average_order_value(),
            previous.average_order_value(),
        )),
        payment_method_pct: PaymentMix {
            cash: round2(mix.cash),
            mobile_money: round2(mix.mobile_money),
            card: round2(mix.card),
            other: round2(mix.other),
        },
        skipped_records: current.skipped + previous.skipped,
        computed_at: Utc::now(),
    })
}

fn window_totals(transactions: &[Transaction], window: &DateRange) -> WindowTotals {
    let mut totals = WindowTotals::default();

    for tx in transactions {
        if tx.status != TransactionStatus::Completed || !window.contains(tx.created_at) {
            continue;
        }
        if !tx.total.is_finite() || tx.total < 0.0 {
            totals.skipped += 1;
            continue;
        }

        totals.revenue += tx.total;
        totals.count += 1;
        match tx.payment_method {
            PaymentMethod::Cash => totals.cash += 1,
            PaymentMethod::MobileMoney => totals.mobile_money += 1,
            PaymentMethod::Card => totals.card += 1,
            PaymentMethod::Other => totals.other += 1,
        }
    }

    totals
}

/// Round to 2 decimal places; applied only at the output boundary.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

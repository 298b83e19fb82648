//! Ledger metrics collection
//!
//! Plain atomic counters shared by every component, rendered in Prometheus
//! text format on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct LedgerMetrics {
    start_time: Instant,

    // Coordinator
    pub commits_total: AtomicU64,
    pub conflicts_retried_total: AtomicU64,
    pub conflicts_surfaced_total: AtomicU64,
    pub aborts_total: AtomicU64,

    // Settlement
    pub bets_settled_total: AtomicU64,
    pub wins_total: AtomicU64,
    pub forced_losses_total: AtomicU64,
    pub downgraded_wins_total: AtomicU64,
    pub round_lock_rejections_total: AtomicU64,

    // Lottery
    pub tickets_sold_total: AtomicU64,
    pub purchases_rejected_total: AtomicU64,
    pub draws_completed_total: AtomicU64,
    pub prizes_paid_total: AtomicU64,
    pub prizes_skipped_total: AtomicU64,
    pub slots_created_total: AtomicU64,
    pub slots_recovered_total: AtomicU64,

    // Retention
    pub turnover_locks_total: AtomicU64,
    pub turnover_releases_total: AtomicU64,

    pub events_published_total: AtomicU64,
}

impl LedgerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn counters(&self) -> [(&'static str, &'static str, &AtomicU64); 19] {
        [
            ("commits_total", "Committed coordinator scopes", &self.commits_total),
            ("conflicts_retried_total", "Write conflicts retried", &self.conflicts_retried_total),
            ("conflicts_surfaced_total", "Write conflicts returned to callers", &self.conflicts_surfaced_total),
            ("aborts_total", "Scopes rolled back by an error", &self.aborts_total),
            ("bets_settled_total", "Instant-game rounds settled", &self.bets_settled_total),
            ("wins_total", "Rounds settled with a payout", &self.wins_total),
            ("forced_losses_total", "Nominal wins turned into losses by the profit guard", &self.forced_losses_total),
            ("downgraded_wins_total", "Nominal wins reduced to a lower tier", &self.downgraded_wins_total),
            ("round_lock_rejections_total", "Rounds rejected because another was in progress", &self.round_lock_rejections_total),
            ("tickets_sold_total", "Lottery tickets sold", &self.tickets_sold_total),
            ("purchases_rejected_total", "Ticket purchases rejected", &self.purchases_rejected_total),
            ("draws_completed_total", "Lottery slots finalized", &self.draws_completed_total),
            ("prizes_paid_total", "Lottery prizes credited", &self.prizes_paid_total),
            ("prizes_skipped_total", "Lottery prizes skipped as unfunded", &self.prizes_skipped_total),
            ("slots_created_total", "Lottery slots created", &self.slots_created_total),
            ("slots_recovered_total", "Stuck DRAWING slots force-finalized", &self.slots_recovered_total),
            ("turnover_locks_total", "Wins locked behind a wagering requirement", &self.turnover_locks_total),
            ("turnover_releases_total", "Locked balances released", &self.turnover_releases_total),
            ("events_published_total", "Platform events published", &self.events_published_total),
        ]
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();

        for (name, help, counter) in self.counters() {
            output.push_str(&format!(
                "# HELP casino_ledger_{name} {help}\n\
                 # TYPE casino_ledger_{name} counter\n\
                 casino_ledger_{name} {}\n\n",
                Self::get(counter)
            ));
        }

        output.push_str(&format!(
            "# HELP casino_ledger_uptime_seconds Seconds since start\n\
             # TYPE casino_ledger_uptime_seconds gauge\n\
             casino_ledger_uptime_seconds {}\n\n",
            self.uptime_secs()
        ));

        output
    }
}

impl Default for LedgerMetrics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            commits_total: AtomicU64::new(0),
            conflicts_retried_total: AtomicU64::new(0),
            conflicts_surfaced_total: AtomicU64::new(0),
            aborts_total: AtomicU64::new(0),
            bets_settled_total: AtomicU64::new(0),
            wins_total: AtomicU64::new(0),
            forced_losses_total: AtomicU64::new(0),
            downgraded_wins_total: AtomicU64::new(0),
            round_lock_rejections_total: AtomicU64::new(0),
            tickets_sold_total: AtomicU64::new(0),
            purchases_rejected_total: AtomicU64::new(0),
            draws_completed_total: AtomicU64::new(0),
            prizes_paid_total: AtomicU64::new(0),
            prizes_skipped_total: AtomicU64::new(0),
            slots_created_total: AtomicU64::new(0),
            slots_recovered_total: AtomicU64::new(0),
            turnover_locks_total: AtomicU64::new(0),
            turnover_releases_total: AtomicU64::new(0),
            events_published_total: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_output() {
        let metrics = LedgerMetrics::new();
        LedgerMetrics::inc(&metrics.commits_total);
        LedgerMetrics::add(&metrics.tickets_sold_total, 50);

        let text = metrics.to_prometheus_format();
        assert!(text.contains("casino_ledger_commits_total 1\n"));
        assert!(text.contains("casino_ledger_tickets_sold_total 50\n"));
        assert!(text.contains("# TYPE casino_ledger_uptime_seconds gauge"));
    }
}

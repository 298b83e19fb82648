//! Profit guard
//!
//! Bounds payouts so the house keeps its configured margin over a trailing
//! window. Bet and payout totals are kept in hourly buckets, written in the
//! same scope as the wallet change that caused them:
//!
//! - `stats:<scope>:<hour>:<shard>` -> [`StatsBucket`], scope is `all` or a game
//! - `activity:<user_id>:<hour>` -> rounds played by the user in that hour
//!
//! Buckets are sharded by user so unrelated users do not contend on one row.
//! Reads sum committed buckets and may trail in-flight settlements.

use crate::amount::Amount;
use crate::config::{ProfitConfig, RuntimeConfigHandle};
use crate::coordinator::Scope;
use crate::errors::{LedgerError, LedgerResult};
use crate::storage::{decode, LedgerStorage};
use serde::{Deserialize, Serialize};

pub const GLOBAL_SCOPE: &str = "all";
pub const STAT_SHARDS: u32 = 16;

const HOUR_MS: i64 = 3_600_000;

pub fn hour_of(ts_millis: i64) -> i64 {
    ts_millis.div_euclid(HOUR_MS)
}

fn shard_of(user_id: &str) -> u32 {
    user_id
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32))
        % STAT_SHARDS
}

fn bucket_prefix(scope: &str, hour: i64) -> String {
    format!("stats:{}:{:012}:", scope, hour.max(0))
}

fn activity_key(user_id: &str, hour: i64) -> String {
    format!("activity:{}:{:012}", user_id, hour.max(0))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsBucket {
    pub total_bets: Amount,
    pub total_payouts: Amount,
    pub rounds: u64,
}

/// Derived pool figures for one scope and window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub scope: String,
    pub window_hours: u32,
    pub total_bets: Amount,
    pub total_payouts: Amount,
    pub vault_tax: Amount,
    pub profit_margin: Amount,
    pub max_allowed_payouts: Amount,
    /// Never negative.
    pub available_pool: Amount,
    pub cold_start_bets: Amount,
    pub cold_start_max_payout: Amount,
}

impl PoolSnapshot {
    pub fn compute(scope: &str, total_bets: Amount, total_payouts: Amount, config: &ProfitConfig) -> Self {
        let vault_tax = total_bets.mul_percent(config.vault_tax_percent);
        let profit_margin = total_bets.mul_percent(config.margin_percent);
        let max_allowed_payouts = total_bets
            .checked_sub(profit_margin)
            .and_then(|a| a.checked_sub(vault_tax))
            .unwrap_or(Amount::ZERO);
        let available_pool = max_allowed_payouts
            .checked_sub(total_payouts)
            .unwrap_or(Amount::ZERO)
            .max(Amount::ZERO);

        Self {
            scope: scope.to_string(),
            window_hours: config.window_hours,
            total_bets,
            total_payouts,
            vault_tax,
            profit_margin,
            max_allowed_payouts,
            available_pool,
            cold_start_bets: config.cold_start_bets,
            cold_start_max_payout: config.cold_start_max_payout,
        }
    }

    /// Safe if it fits the pool, or if volume is still below the cold-start
    /// threshold and the payout is small.
    pub fn is_payout_safe(&self, amount: Amount) -> bool {
        amount <= self.available_pool
            || (self.total_bets < self.cold_start_bets && amount < self.cold_start_max_payout)
    }
}

#[derive(Clone)]
pub struct ProfitGuard {
    storage: LedgerStorage,
    runtime: RuntimeConfigHandle,
}

impl ProfitGuard {
    pub fn new(storage: LedgerStorage, runtime: RuntimeConfigHandle) -> Self {
        Self { storage, runtime }
    }

    /// Add one settlement's volume to the global and the per-game bucket.
    pub fn record(
        &self,
        scope: &Scope<'_>,
        game_scope: &str,
        user_id: &str,
        bets: Amount,
        payouts: Amount,
        rounds: u64,
    ) -> LedgerResult<()> {
        let hour = hour_of(scope.now());
        let shard = shard_of(user_id);

        for stats_scope in [GLOBAL_SCOPE, game_scope] {
            let key = format!("{}{:02}", bucket_prefix(stats_scope, hour), shard);
            let mut bucket: StatsBucket = scope.get_for_update(&key)?.unwrap_or_default();
            bucket.total_bets = bucket
                .total_bets
                .checked_add(bets)
                .ok_or_else(|| LedgerError::invalid("bet statistics overflow"))?;
            bucket.total_payouts = bucket
                .total_payouts
                .checked_add(payouts)
                .ok_or_else(|| LedgerError::invalid("payout statistics overflow"))?;
            bucket.rounds += rounds;
            scope.put(&key, &bucket)?;
        }
        Ok(())
    }

    /// Count one round towards the user's loyalty activity.
    pub fn record_activity(&self, scope: &Scope<'_>, user_id: &str) -> LedgerResult<()> {
        let key = activity_key(user_id, hour_of(scope.now()));
        let rounds: u64 = scope.get_for_update(&key)?.unwrap_or(0);
        scope.put(&key, &(rounds + 1))
    }

    /// Rounds played by `user_id` in the trailing `window_hours`.
    pub fn rounds_in_window(&self, user_id: &str, window_hours: u32, now: i64) -> LedgerResult<u64> {
        let current = hour_of(now);
        let mut total = 0;
        for hour in (current - window_hours as i64 + 1)..=current {
            if let Some(rounds) = self.storage.get_json::<u64>(activity_key(user_id, hour).as_bytes())? {
                total += rounds;
            }
        }
        Ok(total)
    }

    /// Totals for `stats_scope` over the trailing window ending at `now`.
    pub fn totals(&self, stats_scope: &str, window_hours: u32, now: i64) -> LedgerResult<StatsBucket> {
        let current = hour_of(now);
        let mut totals = StatsBucket::default();
        for hour in (current - window_hours as i64 + 1)..=current {
            let prefix = bucket_prefix(stats_scope, hour);
            for (key, value) in self.storage.scan_prefix(prefix.as_bytes(), None, STAT_SHARDS as usize)? {
                let bucket: StatsBucket = decode(&key, &value)?;
                totals.total_bets = totals.total_bets.saturating_add(bucket.total_bets);
                totals.total_payouts = totals.total_payouts.saturating_add(bucket.total_payouts);
                totals.rounds += bucket.rounds;
            }
        }
        Ok(totals)
    }

    /// Pool for `game`, or the global pool when `None` or when per-game pools
    /// are disabled.
    pub fn safe_payout_pool(&self, game: Option<&str>, now: i64) -> LedgerResult<PoolSnapshot> {
        let runtime = self.runtime.snapshot();
        self.pool_with(&runtime.profit, game, now)
    }

    pub fn pool_with(&self, config: &ProfitConfig, game: Option<&str>, now: i64) -> LedgerResult<PoolSnapshot> {
        let stats_scope = match game {
            Some(game) if config.per_game_pools => game,
            _ => GLOBAL_SCOPE,
        };
        let totals = self.totals(stats_scope, config.window_hours, now)?;
        Ok(PoolSnapshot::compute(stats_scope, totals.total_bets, totals.total_payouts, config))
    }

    pub fn is_payout_safe(&self, amount: Amount, game: Option<&str>, now: i64) -> LedgerResult<bool> {
        Ok(self.safe_payout_pool(game, now)?.is_payout_safe(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_arithmetic() {
        let config = ProfitConfig::default();
        let pool = PoolSnapshot::compute("all", Amount::units(10_000), Amount::units(5_000), &config);

        assert_eq!(pool.vault_tax, Amount::units(500));
        assert_eq!(pool.profit_margin, Amount::units(3_000));
        assert_eq!(pool.max_allowed_payouts, Amount::units(6_500));
        assert_eq!(pool.available_pool, Amount::units(1_500));
        assert!(pool.is_payout_safe(Amount::units(1_500)));
        assert!(!pool.is_payout_safe(Amount::from_micros(1_500_000_001)));
    }

    #[test]
    fn test_pool_never_negative() {
        let config = ProfitConfig::default();
        let pool = PoolSnapshot::compute("all", Amount::units(2_000), Amount::units(9_000), &config);
        assert_eq!(pool.available_pool, Amount::ZERO);
        assert!(!pool.is_payout_safe(Amount::units(1)));
    }

    #[test]
    fn test_cold_start_exception() {
        let config = ProfitConfig::default();
        let pool = PoolSnapshot::compute("all", Amount::units(100), Amount::ZERO, &config);

        // Pool is 65 but small payouts pass while volume is below 1000.
        assert!(pool.is_payout_safe(Amount::from_micros(49_999_999)));
        assert!(!pool.is_payout_safe(Amount::units(80)));

        let warm = PoolSnapshot::compute("all", Amount::units(1_000), Amount::units(700), &config);
        assert_eq!(warm.available_pool, Amount::ZERO);
        assert!(!warm.is_payout_safe(Amount::units(10)));
    }

    #[test]
    fn test_hour_bucketing() {
        assert_eq!(hour_of(0), 0);
        assert_eq!(hour_of(HOUR_MS - 1), 0);
        assert_eq!(hour_of(HOUR_MS), 1);
        assert!(shard_of("alice") < STAT_SHARDS);
    }
}

//! Game settlement engine
//!
//! Settles instant-game rounds against the `game` balance. Per round, inside
//! one coordinator scope: check the round id is new, lock the wallet, verify
//! funds, debit the bet, credit any guarded win, update turnover, record the
//! round and the profit statistics. The per-user round lock is taken before
//! the scope and renewed right before commit.
//!
//! A crash round's crash point and proof stay under `crash_seal:<round_id>`
//! until cash-out; the round record shows neither while the round is open.

use crate::amount::Amount;
use crate::config::{RuntimeConfig, RuntimeConfigHandle, SettlementConfig};
use crate::coordinator::TransactionCoordinator;
use crate::errors::{LedgerError, LedgerResult};
use crate::games::outcome::{
    apply_guard, crash_point, multiplier_to_bps, nominal_outcome, win_probability, OutcomeSource,
};
use crate::games::round_lock::{RoundLockGuard, RoundLocks};
use crate::games::types::{GameKind, GuardDecision, RoundRecord, RoundStatus, SealedCrash, SettlementResult};
use crate::journal::TxType;
use crate::metrics::LedgerMetrics;
use crate::profit_guard::ProfitGuard;
use crate::retention::RetentionEngine;
use crate::storage::validate_id;
use crate::wallet::{BalanceKind, Posting, Wallet, WalletLedger};
use std::sync::Arc;
use std::time::Duration;

pub fn round_key(round_id: &str) -> String {
    format!("round:{}", round_id)
}

fn crash_seal_key(round_id: &str) -> String {
    format!("crash_seal:{}", round_id)
}

#[derive(Clone)]
pub struct SettlementEngine {
    coordinator: TransactionCoordinator,
    ledger: WalletLedger,
    guard: ProfitGuard,
    retention: RetentionEngine,
    locks: RoundLocks,
    outcome: Arc<dyn OutcomeSource>,
    runtime: RuntimeConfigHandle,
    config: SettlementConfig,
    metrics: Arc<LedgerMetrics>,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: TransactionCoordinator,
        ledger: WalletLedger,
        guard: ProfitGuard,
        retention: RetentionEngine,
        outcome: Arc<dyn OutcomeSource>,
        runtime: RuntimeConfigHandle,
        config: SettlementConfig,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        let locks = RoundLocks::new(Duration::from_millis(config.round_lock_ttl_ms));
        Self {
            coordinator,
            ledger,
            guard,
            retention,
            locks,
            outcome,
            runtime,
            config,
            metrics,
        }
    }

    pub fn round_locks(&self) -> &RoundLocks {
        &self.locks
    }

    pub fn get_round(&self, round_id: &str) -> LedgerResult<Option<RoundRecord>> {
        self.coordinator.storage().get_json(round_key(round_id).as_bytes())
    }

    fn acquire(&self, user_id: &str) -> LedgerResult<RoundLockGuard> {
        self.locks.acquire(user_id).map_err(|e| {
            LedgerMetrics::inc(&self.metrics.round_lock_rejections_total);
            tracing::debug!(user_id, "Round rejected, another round in progress");
            e
        })
    }

    fn validate_bet(&self, bet: Amount) -> LedgerResult<()> {
        if bet < self.config.min_bet || bet > self.config.max_bet {
            return Err(LedgerError::invalid(format!(
                "bet {} outside allowed range {}..={}",
                bet, self.config.min_bet, self.config.max_bet
            )));
        }
        Ok(())
    }

    /// Settle one round. For crash the round is only opened here: the bet is
    /// debited and the crash point drawn; [`Self::cash_out`] finishes it.
    pub fn settle_bet(
        &self,
        user_id: &str,
        bet: Amount,
        game: GameKind,
        round_id: &str,
    ) -> LedgerResult<SettlementResult> {
        validate_id("user id", user_id)?;
        validate_id("round id", round_id)?;
        self.validate_bet(bet)?;

        let lock = self.acquire(user_id)?;
        let runtime = self.runtime.snapshot();
        let now = crate::now_millis();

        let rounds = self
            .guard
            .rounds_in_window(user_id, runtime.odds.loyalty_window_hours, now)?;
        let probability = win_probability(&runtime.odds, rounds);
        let entropy = self.outcome.draw(round_id, game, user_id)?;
        let pool = self.guard.pool_with(&runtime.profit, Some(game.as_str()), now)?;

        let result = self.coordinator.execute("settle_bet", |scope| {
            let key = round_key(round_id);
            if scope.get_for_update::<RoundRecord>(&key)?.is_some() {
                return Err(LedgerError::DuplicateRound(round_id.to_string()));
            }

            let mut wallet = self.ledger.load_for_update(scope, user_id)?;
            if wallet.game < bet {
                return Err(LedgerError::InsufficientFunds {
                    user_id: user_id.to_string(),
                    balance: BalanceKind::Game.to_string(),
                    available: wallet.game,
                    required: bet,
                });
            }

            let released = self.retention.record_wager(scope, &mut wallet, bet)?;

            let mut record = RoundRecord {
                round_id: round_id.to_string(),
                user_id: user_id.to_string(),
                game,
                bet,
                payout: Amount::ZERO,
                decision: None,
                status: RoundStatus::Open,
                multiplier_bps: None,
                crash_point_bps: None,
                win_probability: probability,
                locked: false,
                proof: entropy.proof.clone(),
                created_at: scope.now(),
                settled_at: None,
            };

            if game == GameKind::Crash {
                let sealed = SealedCrash {
                    crash_point_bps: crash_point(probability, &entropy),
                    proof: record.proof.take(),
                };
                scope.put(&crash_seal_key(round_id), &sealed)?;
                let posting = Posting::new(TxType::RoundOpen, format!("crash round {}", round_id))
                    .delta(BalanceKind::Game, -bet)
                    .reference(round_id);
                self.ledger.apply(scope, &mut wallet, posting)?;
            } else {
                let tiers = game.payout_tiers();
                let nominal = nominal_outcome(probability, &entropy, tiers);
                let guarded = apply_guard(nominal, bet, tiers, |payout| pool.is_payout_safe(payout));

                record.locked = guarded.payout.is_positive()
                    && RetentionEngine::should_lock(&runtime.retention, guarded.payout);
                let destination = if record.locked {
                    BalanceKind::GameLocked
                } else {
                    BalanceKind::Game
                };

                let posting = Posting::new(TxType::GameSettlement, format!("{} round {}", game, round_id))
                    .delta(BalanceKind::Game, -bet)
                    .delta(destination, guarded.payout)
                    .reference(round_id);
                self.ledger.apply(scope, &mut wallet, posting)?;

                if record.locked {
                    self.retention.lock_win(&runtime.retention, &mut wallet, guarded.payout)?;
                }

                record.payout = guarded.payout;
                record.multiplier_bps = guarded.multiplier_bps;
                record.decision = Some(guarded.decision);
                record.status = RoundStatus::Settled;
                record.settled_at = Some(scope.now());
            }

            self.guard
                .record(scope, game.as_str(), user_id, bet, record.payout, 1)?;
            self.guard.record_activity(scope, user_id)?;
            self.ledger.store(scope, &wallet)?;
            scope.put(&key, &record)?;

            lock.renew()?;
            Ok(Self::result(record, &wallet, released))
        })?;

        self.count(&result.round);
        tracing::info!(
            user_id,
            round_id,
            game = %game,
            %bet,
            payout = %result.round.payout,
            decision = ?result.round.decision,
            "Round settled"
        );
        Ok(result)
    }

    /// Cash out an open crash round at `multiplier`. At or below the crash
    /// point the round pays `bet x multiplier` if the pool allows it; above
    /// it, or when the pool does not, the round settles as a loss.
    pub fn cash_out(&self, user_id: &str, round_id: &str, multiplier: f64) -> LedgerResult<SettlementResult> {
        validate_id("user id", user_id)?;
        let multiplier_bps = multiplier_to_bps(multiplier)
            .ok_or_else(|| LedgerError::invalid(format!("invalid cash-out multiplier {}", multiplier)))?;

        let lock = self.acquire(user_id)?;
        let runtime: Arc<RuntimeConfig> = self.runtime.snapshot();
        let pool = self
            .guard
            .pool_with(&runtime.profit, Some(GameKind::Crash.as_str()), crate::now_millis())?;

        let result = self.coordinator.execute("cash_out", |scope| {
            let key = round_key(round_id);
            let mut record: RoundRecord = scope
                .get_for_update(&key)?
                .filter(|r: &RoundRecord| r.user_id == user_id)
                .ok_or_else(|| LedgerError::RoundNotFound(round_id.to_string()))?;
            if record.game != GameKind::Crash {
                return Err(LedgerError::invalid(format!("round {} is not a crash round", round_id)));
            }
            if record.status == RoundStatus::Settled {
                return Err(LedgerError::DuplicateRound(round_id.to_string()));
            }

            let seal_key = crash_seal_key(round_id);
            let sealed: SealedCrash = scope.get_for_update(&seal_key)?.ok_or_else(|| {
                LedgerError::Storage(format!("open crash round {} has no sealed crash point", round_id))
            })?;
            let crash_point = sealed.crash_point_bps;

            let mut wallet = self.ledger.load_for_update(scope, user_id)?;

            let (payout, decision) = if multiplier_bps > crash_point {
                (Amount::ZERO, GuardDecision::Loss)
            } else {
                let payout = record.bet.mul_bps(multiplier_bps);
                if pool.is_payout_safe(payout) {
                    (payout, GuardDecision::Paid)
                } else {
                    (Amount::ZERO, GuardDecision::ForcedLoss)
                }
            };

            if payout.is_positive() {
                record.locked = RetentionEngine::should_lock(&runtime.retention, payout);
                let destination = if record.locked {
                    BalanceKind::GameLocked
                } else {
                    BalanceKind::Game
                };
                let posting = Posting::new(TxType::CashOut, format!("crash cash-out {}", round_id))
                    .delta(destination, payout)
                    .reference(round_id);
                self.ledger.apply(scope, &mut wallet, posting)?;

                if record.locked {
                    self.retention.lock_win(&runtime.retention, &mut wallet, payout)?;
                    self.ledger.store(scope, &wallet)?;
                }
                record.multiplier_bps = Some(multiplier_bps);
                self.guard
                    .record(scope, GameKind::Crash.as_str(), user_id, Amount::ZERO, payout, 0)?;
            }

            record.payout = payout;
            record.decision = Some(decision);
            record.crash_point_bps = Some(crash_point);
            record.proof = sealed.proof;
            record.status = RoundStatus::Settled;
            record.settled_at = Some(scope.now());
            scope.put(&key, &record)?;
            scope.delete(&seal_key)?;

            lock.renew()?;
            Ok(Self::result(record, &wallet, None))
        })?;

        self.count(&result.round);
        tracing::info!(
            user_id,
            round_id,
            multiplier_bps,
            payout = %result.round.payout,
            decision = ?result.round.decision,
            "Crash round cashed out"
        );
        Ok(result)
    }

    fn result(round: RoundRecord, wallet: &Wallet, released: Option<Amount>) -> SettlementResult {
        SettlementResult {
            round,
            game_balance: wallet.game,
            game_locked_balance: wallet.game_locked,
            released,
        }
    }

    fn count(&self, round: &RoundRecord) {
        if round.status != RoundStatus::Settled {
            return;
        }
        LedgerMetrics::inc(&self.metrics.bets_settled_total);
        match round.decision {
            Some(GuardDecision::Paid) => LedgerMetrics::inc(&self.metrics.wins_total),
            Some(GuardDecision::Downgraded) => {
                LedgerMetrics::inc(&self.metrics.wins_total);
                LedgerMetrics::inc(&self.metrics.downgraded_wins_total);
            }
            Some(GuardDecision::ForcedLoss) => {
                LedgerMetrics::inc(&self.metrics.forced_losses_total);
                tracing::debug!(round_id = %round.round_id, "Nominal win forced to a loss by the profit guard");
            }
            Some(GuardDecision::Loss) | None => {}
        }
    }
}

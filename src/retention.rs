//! Retention / turnover engine
//!
//! Large wins are credited to `game_locked` and attach a wagering
//! requirement of `win x lock_multiplier`. Every instant-game bet while a
//! requirement is active adds to `turnover.completed`; once it reaches
//! `turnover.required` the whole locked balance moves to `game` and both
//! counters go back to zero.
//!
//! All changes are made on a wallet already locked in the caller's scope.

use crate::amount::Amount;
use crate::config::RetentionConfig;
use crate::coordinator::Scope;
use crate::errors::{LedgerError, LedgerResult};
use crate::journal::TxType;
use crate::metrics::LedgerMetrics;
use crate::wallet::{BalanceKind, Posting, Wallet, WalletLedger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnoverStatus {
    pub user_id: String,
    pub required: Amount,
    pub completed: Amount,
    pub remaining: Amount,
    pub locked_balance: Amount,
    /// True when nothing is locked behind an unmet requirement.
    pub eligible: bool,
}

impl TurnoverStatus {
    pub fn of(wallet: &Wallet) -> Self {
        let remaining = wallet.turnover.remaining();
        Self {
            user_id: wallet.user_id.clone(),
            required: wallet.turnover.required,
            completed: wallet.turnover.completed,
            remaining,
            locked_balance: wallet.game_locked,
            eligible: !wallet.turnover.is_active() || remaining.is_zero(),
        }
    }
}

#[derive(Clone)]
pub struct RetentionEngine {
    ledger: WalletLedger,
    metrics: Arc<LedgerMetrics>,
}

impl RetentionEngine {
    pub fn new(ledger: WalletLedger, metrics: Arc<LedgerMetrics>) -> Self {
        Self { ledger, metrics }
    }

    /// Whether a payout of `win` gets locked.
    pub fn should_lock(config: &RetentionConfig, win: Amount) -> bool {
        config.lock_multiplier > 0 && win > config.big_win_threshold
    }

    /// Count `bet` towards an active requirement and release the locked
    /// balance when the requirement is met. Returns the released amount.
    pub fn record_wager(
        &self,
        scope: &mut Scope<'_>,
        wallet: &mut Wallet,
        bet: Amount,
    ) -> LedgerResult<Option<Amount>> {
        if !wallet.turnover.is_active() {
            return Ok(None);
        }

        let completed = wallet
            .turnover
            .completed
            .checked_add(bet)
            .ok_or_else(|| LedgerError::invalid("turnover overflow"))?;
        wallet.turnover.completed = completed.min(wallet.turnover.required);

        if wallet.turnover.completed < wallet.turnover.required {
            return Ok(None);
        }

        let released = wallet.game_locked;
        let required = wallet.turnover.required;
        wallet.turnover = Default::default();

        if released.is_zero() {
            // Requirement met with nothing locked, only the counters change.
            return Ok(None);
        }

        let posting = Posting::new(TxType::TurnoverRelease, format!("wagering requirement of {} met", required))
            .delta(BalanceKind::GameLocked, -released)
            .delta(BalanceKind::Game, released);
        self.ledger.apply(scope, wallet, posting)?;

        LedgerMetrics::inc(&self.metrics.turnover_releases_total);
        tracing::info!(user_id = %wallet.user_id, %released, %required, "Locked balance released");
        Ok(Some(released))
    }

    /// Attach the requirement for a locked win. The credit itself is part of
    /// the settlement posting.
    pub fn lock_win(&self, config: &RetentionConfig, wallet: &mut Wallet, win: Amount) -> LedgerResult<()> {
        let added = win
            .checked_mul_int(config.lock_multiplier as u64)
            .ok_or_else(|| LedgerError::invalid("turnover requirement overflow"))?;
        wallet.turnover.required = wallet
            .turnover
            .required
            .checked_add(added)
            .ok_or_else(|| LedgerError::invalid("turnover requirement overflow"))?;

        LedgerMetrics::inc(&self.metrics.turnover_locks_total);
        tracing::info!(user_id = %wallet.user_id, %win, %added, "Win locked behind wagering requirement");
        Ok(())
    }

    pub fn check_turnover_eligibility(&self, user_id: &str) -> LedgerResult<TurnoverStatus> {
        Ok(TurnoverStatus::of(&self.ledger.get(user_id)?))
    }
}

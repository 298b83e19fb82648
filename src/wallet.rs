//! Wallet ledger
//!
//! One [`Wallet`] per user holding independently tracked named balances. The
//! only way to change a balance is [`WalletLedger::apply`] (or its wrappers)
//! on a coordinator [`Scope`], which validates every step and appends exactly
//! one journal entry for the mutation.

use crate::amount::Amount;
use crate::coordinator::{Scope, TransactionCoordinator};
use crate::errors::{LedgerError, LedgerResult};
use crate::events::PlatformEvent;
use crate::journal::{Journal, LogEntry, TxType};
use crate::storage::{validate_id, LedgerStorage};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const WALLET_PREFIX: &str = "wallet:";

pub fn wallet_key(user_id: &str) -> String {
    format!("{}{}", WALLET_PREFIX, user_id)
}

/// Named balance inside a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceKind {
    Main,
    Game,
    Income,
    Purchase,
    Agent,
    Commission,
    PendingReferral,
    GameLocked,
    EscrowLocked,
}

impl BalanceKind {
    pub const ALL: [BalanceKind; 9] = [
        BalanceKind::Main,
        BalanceKind::Game,
        BalanceKind::Income,
        BalanceKind::Purchase,
        BalanceKind::Agent,
        BalanceKind::Commission,
        BalanceKind::PendingReferral,
        BalanceKind::GameLocked,
        BalanceKind::EscrowLocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceKind::Main => "main",
            BalanceKind::Game => "game",
            BalanceKind::Income => "income",
            BalanceKind::Purchase => "purchase",
            BalanceKind::Agent => "agent",
            BalanceKind::Commission => "commission",
            BalanceKind::PendingReferral => "pending_referral",
            BalanceKind::GameLocked => "game_locked",
            BalanceKind::EscrowLocked => "escrow_locked",
        }
    }
}

impl fmt::Display for BalanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BalanceKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BalanceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LedgerError::invalid(format!("unknown balance '{}'", s)))
    }
}

/// Wagering requirement attached to locked wins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turnover {
    pub required: Amount,
    pub completed: Amount,
}

impl Turnover {
    pub fn is_active(&self) -> bool {
        self.required.is_positive()
    }

    pub fn remaining(&self) -> Amount {
        self.required
            .checked_sub(self.completed)
            .unwrap_or(Amount::ZERO)
            .max(Amount::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub main: Amount,
    pub game: Amount,
    pub income: Amount,
    pub purchase: Amount,
    pub agent: Amount,
    pub commission: Amount,
    pub pending_referral: Amount,
    pub game_locked: Amount,
    pub escrow_locked: Amount,
    pub turnover: Turnover,
    /// Incremented by every posting.
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Wallet {
    pub fn zeroed(user_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            main: Amount::ZERO,
            game: Amount::ZERO,
            income: Amount::ZERO,
            purchase: Amount::ZERO,
            agent: Amount::ZERO,
            commission: Amount::ZERO,
            pending_referral: Amount::ZERO,
            game_locked: Amount::ZERO,
            escrow_locked: Amount::ZERO,
            turnover: Turnover::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn balance(&self, kind: BalanceKind) -> Amount {
        match kind {
            BalanceKind::Main => self.main,
            BalanceKind::Game => self.game,
            BalanceKind::Income => self.income,
            BalanceKind::Purchase => self.purchase,
            BalanceKind::Agent => self.agent,
            BalanceKind::Commission => self.commission,
            BalanceKind::PendingReferral => self.pending_referral,
            BalanceKind::GameLocked => self.game_locked,
            BalanceKind::EscrowLocked => self.escrow_locked,
        }
    }

    fn balance_mut(&mut self, kind: BalanceKind) -> &mut Amount {
        match kind {
            BalanceKind::Main => &mut self.main,
            BalanceKind::Game => &mut self.game,
            BalanceKind::Income => &mut self.income,
            BalanceKind::Purchase => &mut self.purchase,
            BalanceKind::Agent => &mut self.agent,
            BalanceKind::Commission => &mut self.commission,
            BalanceKind::PendingReferral => &mut self.pending_referral,
            BalanceKind::GameLocked => &mut self.game_locked,
            BalanceKind::EscrowLocked => &mut self.escrow_locked,
        }
    }

    pub fn balances(&self) -> Vec<(BalanceKind, Amount)> {
        BalanceKind::ALL.into_iter().map(|k| (k, self.balance(k))).collect()
    }

    /// Apply deltas in order, failing on the first step that would go below
    /// zero. `self` is left untouched on error.
    pub fn apply_deltas(&mut self, deltas: &[(BalanceKind, Amount)]) -> LedgerResult<()> {
        let mut next = self.clone();
        for &(kind, delta) in deltas {
            let current = next.balance(kind);
            let updated = current
                .checked_add(delta)
                .ok_or_else(|| LedgerError::invalid(format!("{} overflow for {}", kind, self.user_id)))?;
            if updated.is_negative() {
                return Err(LedgerError::InsufficientFunds {
                    user_id: self.user_id.clone(),
                    balance: kind.to_string(),
                    available: current,
                    required: -delta,
                });
            }
            *next.balance_mut(kind) = updated;
        }
        *self = next;
        Ok(())
    }
}

/// A balance mutation plus the metadata for its journal entry
#[derive(Debug, Clone)]
pub struct Posting {
    pub tx_type: TxType,
    pub deltas: Vec<(BalanceKind, Amount)>,
    pub description: String,
    pub reference: Option<String>,
}

impl Posting {
    pub fn new(tx_type: TxType, description: impl Into<String>) -> Self {
        Self {
            tx_type,
            deltas: Vec::new(),
            description: description.into(),
            reference: None,
        }
    }

    pub fn delta(mut self, kind: BalanceKind, amount: Amount) -> Self {
        if !amount.is_zero() {
            self.deltas.push((kind, amount));
        }
        self
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Balance the entry is reported against: the first one touched.
    pub fn primary(&self) -> BalanceKind {
        self.deltas.first().map(|(k, _)| *k).unwrap_or(BalanceKind::Main)
    }

    /// Net change of the primary balance.
    pub fn net(&self) -> Amount {
        let primary = self.primary();
        self.deltas
            .iter()
            .filter(|(k, _)| *k == primary)
            .map(|(_, a)| *a)
            .sum()
    }
}

/// Wallet reads and scoped mutations
#[derive(Clone)]
pub struct WalletLedger {
    storage: LedgerStorage,
    journal: Journal,
}

impl WalletLedger {
    pub fn new(storage: LedgerStorage) -> Self {
        let journal = Journal::new(storage.clone());
        Self { storage, journal }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Committed snapshot of a wallet.
    pub fn get(&self, user_id: &str) -> LedgerResult<Wallet> {
        self.storage
            .get_json(wallet_key(user_id).as_bytes())?
            .ok_or_else(|| LedgerError::WalletNotFound(user_id.to_string()))
    }

    /// Create a zeroed wallet; returns the existing one if already present.
    pub fn create_wallet(&self, coordinator: &TransactionCoordinator, user_id: &str) -> LedgerResult<Wallet> {
        validate_id("user id", user_id)?;
        coordinator.execute("create_wallet", |scope| {
            let key = wallet_key(user_id);
            if let Some(existing) = scope.get_for_update::<Wallet>(&key)? {
                return Ok(existing);
            }
            let wallet = Wallet::zeroed(user_id, scope.now());
            scope.put(&key, &wallet)?;
            tracing::info!(user_id, "Wallet created");
            Ok(wallet)
        })
    }

    /// Lock and load a wallet for the rest of the scope.
    pub fn load_for_update(&self, scope: &Scope<'_>, user_id: &str) -> LedgerResult<Wallet> {
        scope
            .get_for_update(&wallet_key(user_id))?
            .ok_or_else(|| LedgerError::WalletNotFound(user_id.to_string()))
    }

    /// Apply a posting to a wallet loaded in this scope, append its journal
    /// entry and write the wallet back.
    pub fn apply(&self, scope: &mut Scope<'_>, wallet: &mut Wallet, posting: Posting) -> LedgerResult<LogEntry> {
        if posting.deltas.is_empty() {
            return Err(LedgerError::invalid(format!(
                "{} posting for {} changes nothing",
                posting.tx_type, wallet.user_id
            )));
        }

        wallet.apply_deltas(&posting.deltas)?;
        wallet.version += 1;
        wallet.updated_at = scope.now();

        let primary = posting.primary();
        let entry = LogEntry::completed(wallet, &posting, scope.now());
        self.journal.append(scope, &entry)?;
        self.store(scope, wallet)?;

        scope.emit(PlatformEvent::WalletUpdate {
            user_id: wallet.user_id.clone(),
            balance: primary,
            amount: entry.amount,
            balance_after: wallet.balance(primary),
            reference: posting.reference.clone(),
            timestamp: entry.timestamp,
        });

        Ok(entry)
    }

    /// Lock, load and apply in one call.
    pub fn mutate(&self, scope: &mut Scope<'_>, user_id: &str, posting: Posting) -> LedgerResult<(Wallet, LogEntry)> {
        let mut wallet = self.load_for_update(scope, user_id)?;
        let entry = self.apply(scope, &mut wallet, posting)?;
        Ok((wallet, entry))
    }

    /// Write back non-balance changes (turnover counters).
    pub fn store(&self, scope: &Scope<'_>, wallet: &Wallet) -> LedgerResult<()> {
        scope.put(&wallet_key(&wallet.user_id), wallet)
    }

    pub fn update_turnover<F>(&self, scope: &Scope<'_>, user_id: &str, f: F) -> LedgerResult<Wallet>
    where
        F: FnOnce(&mut Turnover),
    {
        let mut wallet = self.load_for_update(scope, user_id)?;
        f(&mut wallet.turnover);
        wallet.updated_at = scope.now();
        self.store(scope, &wallet)?;
        Ok(wallet)
    }

    pub fn deposit(
        &self,
        coordinator: &TransactionCoordinator,
        user_id: &str,
        balance: BalanceKind,
        amount: Amount,
        description: &str,
    ) -> LedgerResult<Wallet> {
        require_positive(amount)?;
        coordinator.execute("deposit", |scope| {
            let posting = Posting::new(TxType::Deposit, description).delta(balance, amount);
            let (wallet, _) = self.mutate(scope, user_id, posting)?;
            Ok(wallet)
        })
    }

    pub fn withdraw(
        &self,
        coordinator: &TransactionCoordinator,
        user_id: &str,
        balance: BalanceKind,
        amount: Amount,
        description: &str,
    ) -> LedgerResult<Wallet> {
        require_positive(amount)?;
        coordinator.execute("withdraw", |scope| {
            let posting = Posting::new(TxType::Withdrawal, description).delta(balance, -amount);
            let (wallet, _) = self.mutate(scope, user_id, posting)?;
            Ok(wallet)
        })
    }

    /// Move funds between two balances of the same wallet.
    pub fn transfer(
        &self,
        coordinator: &TransactionCoordinator,
        user_id: &str,
        from: BalanceKind,
        to: BalanceKind,
        amount: Amount,
    ) -> LedgerResult<Wallet> {
        require_positive(amount)?;
        if from == to {
            return Err(LedgerError::invalid("transfer source and destination are the same balance"));
        }
        coordinator.execute("transfer", |scope| {
            let posting = Posting::new(TxType::Transfer, format!("{} -> {}", from, to))
                .delta(from, -amount)
                .delta(to, amount);
            let (wallet, _) = self.mutate(scope, user_id, posting)?;
            Ok(wallet)
        })
    }
}

fn require_positive(amount: Amount) -> LedgerResult<()> {
    if !amount.is_positive() {
        return Err(LedgerError::invalid(format!("amount must be positive, got {}", amount)));
    }
    Ok(())
}

//! Append-only transaction journal
//!
//! Key layout:
//! - `log:entry:<entry_id>` -> [`LogEntry`] JSON
//! - `log:user:<user_id>:<ts>:<wallet_version>` -> entry id
//! - `log:type:<tx_type>:<ts>:<entry_id>` -> entry id
//!
//! Entries are written in the same scope as the wallet change they describe
//! and are never updated afterwards.

use crate::amount::Amount;
use crate::coordinator::Scope;
use crate::errors::{LedgerError, LedgerResult};
use crate::storage::{ts_component, LedgerStorage};
use crate::wallet::{BalanceKind, Posting, Wallet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const ENTRY_PREFIX: &str = "log:entry:";
const USER_INDEX_PREFIX: &str = "log:user:";
const TYPE_INDEX_PREFIX: &str = "log:type:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Deposit,
    Withdrawal,
    Transfer,
    GameSettlement,
    RoundOpen,
    CashOut,
    TicketPurchase,
    LotteryWin,
    TurnoverRelease,
    Adjustment,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Deposit => "deposit",
            TxType::Withdrawal => "withdrawal",
            TxType::Transfer => "transfer",
            TxType::GameSettlement => "game_settlement",
            TxType::RoundOpen => "round_open",
            TxType::CashOut => "cash_out",
            TxType::TicketPurchase => "ticket_purchase",
            TxType::LotteryWin => "lottery_win",
            TxType::TurnoverRelease => "turnover_release",
            TxType::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Completed,
}

/// One committed balance mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: String,
    pub user_id: String,
    pub tx_type: TxType,
    /// Signed net change of `balance`.
    pub amount: Amount,
    pub status: EntryStatus,
    pub balance: BalanceKind,
    pub balance_after: Amount,
    /// Every per-balance change, in application order.
    pub deltas: Vec<(BalanceKind, Amount)>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub wallet_version: u64,
    pub timestamp: i64,
}

impl LogEntry {
    /// Entry for a posting that has just been applied to `wallet`.
    pub fn completed(wallet: &Wallet, posting: &Posting, now: i64) -> Self {
        let balance = posting.primary();
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            user_id: wallet.user_id.clone(),
            tx_type: posting.tx_type,
            amount: posting.net(),
            status: EntryStatus::Completed,
            balance,
            balance_after: wallet.balance(balance),
            deltas: posting.deltas.clone(),
            description: posting.description.clone(),
            reference: posting.reference.clone(),
            wallet_version: wallet.version,
            timestamp: now,
        }
    }
}

/// Result of replaying a user's journal against the stored wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub user_id: String,
    pub entries: usize,
    pub replayed: BTreeMap<BalanceKind, Amount>,
    pub mismatches: Vec<BalanceMismatch>,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceMismatch {
    pub balance: BalanceKind,
    pub journal: Amount,
    pub wallet: Amount,
}

#[derive(Clone)]
pub struct Journal {
    storage: LedgerStorage,
}

impl Journal {
    pub fn new(storage: LedgerStorage) -> Self {
        Self { storage }
    }

    pub fn append(&self, scope: &Scope<'_>, entry: &LogEntry) -> LedgerResult<()> {
        let ts = ts_component(entry.timestamp);
        scope.put(&format!("{}{}", ENTRY_PREFIX, entry.entry_id), entry)?;
        scope.put(
            &format!(
                "{}{}:{}:{:020}",
                USER_INDEX_PREFIX, entry.user_id, ts, entry.wallet_version
            ),
            &entry.entry_id,
        )?;
        scope.put(
            &format!("{}{}:{}:{}", TYPE_INDEX_PREFIX, entry.tx_type, ts, entry.entry_id),
            &entry.entry_id,
        )?;
        Ok(())
    }

    pub fn get(&self, entry_id: &str) -> LedgerResult<Option<LogEntry>> {
        self.storage.get_json(format!("{}{}", ENTRY_PREFIX, entry_id).as_bytes())
    }

    /// Oldest-first entries of one user, at most `limit`.
    pub fn history(&self, user_id: &str, limit: usize) -> LedgerResult<Vec<LogEntry>> {
        let prefix = format!("{}{}:", USER_INDEX_PREFIX, user_id);
        self.resolve(self.storage.scan_prefix(prefix.as_bytes(), None, limit)?)
    }

    /// Entries of one type with `timestamp >= since`, oldest first.
    pub fn by_type(&self, tx_type: TxType, since: i64, limit: usize) -> LedgerResult<Vec<LogEntry>> {
        let prefix = format!("{}{}:", TYPE_INDEX_PREFIX, tx_type);
        let start = format!("{}{}", prefix, ts_component(since));
        self.resolve(self.storage.scan_from(prefix.as_bytes(), start.as_bytes(), limit)?)
    }

    fn resolve(&self, rows: Vec<(Vec<u8>, Vec<u8>)>) -> LedgerResult<Vec<LogEntry>> {
        let mut entries = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let entry_id: String = crate::storage::decode(&key, &value)?;
            let entry = self.get(&entry_id)?.ok_or_else(|| {
                LedgerError::Storage(format!(
                    "index {} points at missing entry {}",
                    String::from_utf8_lossy(&key),
                    entry_id
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Replay every entry of `user_id` from zero and compare with `wallet`.
    pub fn reconcile(&self, wallet: &Wallet) -> LedgerResult<Reconciliation> {
        let entries = self.history(&wallet.user_id, usize::MAX)?;

        let mut replayed: BTreeMap<BalanceKind, Amount> =
            BalanceKind::ALL.into_iter().map(|k| (k, Amount::ZERO)).collect();
        for entry in &entries {
            for &(kind, delta) in &entry.deltas {
                let slot = replayed.entry(kind).or_insert(Amount::ZERO);
                *slot = slot.checked_add(delta).ok_or_else(|| {
                    LedgerError::Storage(format!("replay overflow in {} for {}", kind, wallet.user_id))
                })?;
            }
        }

        let mut mismatches = Vec::new();
        for (&kind, &amount) in &replayed {
            if amount != wallet.balance(kind) {
                mismatches.push(BalanceMismatch {
                    balance: kind,
                    journal: amount,
                    wallet: wallet.balance(kind),
                });
            }
        }

        if !mismatches.is_empty() {
            tracing::error!(user_id = %wallet.user_id, mismatches = mismatches.len(), "Journal does not reconcile with wallet");
        }

        Ok(Reconciliation {
            user_id: wallet.user_id.clone(),
            entries: entries.len(),
            replayed,
            mismatches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::TransactionCoordinator;
    use crate::events::EventBus;
    use crate::metrics::LedgerMetrics;
    use crate::wallet::WalletLedger;

    fn setup(dir: &std::path::Path) -> (TransactionCoordinator, WalletLedger) {
        let storage = LedgerStorage::open_path(dir).unwrap();
        let metrics = LedgerMetrics::new();
        let coordinator = TransactionCoordinator::new(
            storage.clone(),
            CoordinatorConfig::default(),
            EventBus::new(metrics.clone()),
            metrics,
        );
        (coordinator, WalletLedger::new(storage))
    }

    #[test]
    fn test_replay_reconciles_with_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, ledger) = setup(dir.path());
        ledger.create_wallet(&coordinator, "dave").unwrap();
        ledger
            .deposit(&coordinator, "dave", BalanceKind::Main, Amount::units(100), "seed")
            .unwrap();
        ledger
            .transfer(&coordinator, "dave", BalanceKind::Main, BalanceKind::Game, Amount::units(40))
            .unwrap();
        ledger
            .withdraw(&coordinator, "dave", BalanceKind::Main, Amount::units(10), "out")
            .unwrap();

        let wallet = ledger.get("dave").unwrap();
        let report = ledger.journal().reconcile(&wallet).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.entries, 3);
        assert_eq!(report.replayed[&BalanceKind::Main], Amount::units(50));
        assert_eq!(report.replayed[&BalanceKind::Game], Amount::units(40));
    }

    #[test]
    fn test_tampered_wallet_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, ledger) = setup(dir.path());
        ledger.create_wallet(&coordinator, "erin").unwrap();
        ledger
            .deposit(&coordinator, "erin", BalanceKind::Main, Amount::units(5), "seed")
            .unwrap();

        let mut wallet = ledger.get("erin").unwrap();
        wallet.main = Amount::units(6);
        let report = ledger.journal().reconcile(&wallet).unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].journal, Amount::units(5));
    }

    #[test]
    fn test_by_type_filters_on_type_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, ledger) = setup(dir.path());
        ledger.create_wallet(&coordinator, "fay").unwrap();
        ledger
            .deposit(&coordinator, "fay", BalanceKind::Main, Amount::units(5), "a")
            .unwrap();
        ledger
            .withdraw(&coordinator, "fay", BalanceKind::Main, Amount::units(1), "b")
            .unwrap();

        let deposits = ledger.journal().by_type(TxType::Deposit, 0, 10).unwrap();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].balance_after, Amount::units(5));

        ledger
            .deposit(&coordinator, "fay", BalanceKind::Main, Amount::units(2), "c")
            .unwrap();
        let first = ledger.journal().by_type(TxType::Deposit, 0, 1).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].balance_after, Amount::units(5));
        let since = ledger.journal().by_type(TxType::Deposit, first[0].timestamp + 1, 10).unwrap();
        assert!(since.iter().all(|e| e.timestamp > first[0].timestamp));

        let future = ledger.journal().by_type(TxType::Deposit, i64::MAX, 10).unwrap();
        assert!(future.is_empty());
    }
}

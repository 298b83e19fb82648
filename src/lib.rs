//! Casino Ledger - Wallet Ledger & Game/Lottery Settlement Engine
//!
//! Exactly-once money movement for a gaming platform: multi-balance wallets
//! with an append-only journal, instant-game settlement bounded by a house
//! profit guard, a lottery draw state machine and wagering requirements on
//! large wins. All state lives in one RocksDB `TransactionDB`.

pub mod amount;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod games;
pub mod journal;
pub mod lottery;
pub mod metrics;
pub mod platform;
pub mod profit_guard;
pub mod retention;
pub mod storage;
pub mod wallet;

pub use amount::Amount;
pub use config::{AppConfig, ConfigBuilder, ConfigLoader, RuntimeConfig, RuntimeConfigHandle};
pub use coordinator::{Scope, TransactionCoordinator};
pub use errors::{ErrorKind, LedgerError, LedgerResult};
pub use events::{EventBus, PlatformEvent};
pub use games::{GameKind, GuardDecision, RoundRecord, SettlementResult};
pub use journal::{LogEntry, Reconciliation, TxType};
pub use lottery::{LotterySlot, PurchaseReceipt, SlotConfig, SlotStatus};
pub use metrics::LedgerMetrics;
pub use platform::Platform;
pub use profit_guard::PoolSnapshot;
pub use retention::TurnoverStatus;
pub use storage::LedgerStorage;
pub use wallet::{BalanceKind, Wallet};

/// Current UTC time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

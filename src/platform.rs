//! Platform entry point
//!
//! Opens storage and wires the coordinator, wallet ledger, profit guard,
//! settlement engine, retention engine and lottery service together. This is
//! the surface the binaries and integration tests use.

use crate::amount::Amount;
use crate::config::{AppConfig, RuntimeConfigHandle};
use crate::coordinator::TransactionCoordinator;
use crate::errors::LedgerResult;
use crate::events::{EventBus, PlatformEvent};
use crate::games::{GameKind, OutcomeSource, RoundRecord, SettlementEngine, SettlementResult, VrfOutcomeSource};
use crate::journal::{LogEntry, Reconciliation};
use crate::lottery::{
    DrawScheduler, LotteryService, LotterySlot, PurchaseReceipt, SchedulerHandle, SlotConfig, TickReport, Ticket,
};
use crate::metrics::LedgerMetrics;
use crate::profit_guard::{PoolSnapshot, ProfitGuard};
use crate::retention::{RetentionEngine, TurnoverStatus};
use crate::storage::LedgerStorage;
use crate::wallet::{BalanceKind, Wallet, WalletLedger};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Platform {
    config: AppConfig,
    storage: LedgerStorage,
    coordinator: TransactionCoordinator,
    ledger: WalletLedger,
    guard: ProfitGuard,
    retention: RetentionEngine,
    settlement: SettlementEngine,
    lottery: Arc<LotteryService>,
    runtime: RuntimeConfigHandle,
    metrics: Arc<LedgerMetrics>,
}

impl Platform {
    /// Open with VRF outcomes (key persisted in the database) and an
    /// OS-seeded draw RNG.
    pub fn open(config: AppConfig) -> LedgerResult<Self> {
        let storage = LedgerStorage::open(&config.storage)?;
        let vrf = VrfOutcomeSource::load_or_create(&storage)?;
        tracing::info!(public_key = %vrf.public_key_hex(), "VRF outcome source ready");
        Self::assemble(config, storage, Arc::new(vrf), StdRng::from_entropy())
    }

    /// Open with an explicit outcome source and lottery RNG.
    pub fn open_with(config: AppConfig, outcome: Arc<dyn OutcomeSource>, rng: StdRng) -> LedgerResult<Self> {
        let storage = LedgerStorage::open(&config.storage)?;
        Self::assemble(config, storage, outcome, rng)
    }

    fn assemble(
        config: AppConfig,
        storage: LedgerStorage,
        outcome: Arc<dyn OutcomeSource>,
        rng: StdRng,
    ) -> LedgerResult<Self> {
        crate::config::validate(&config)?;

        let metrics = LedgerMetrics::new();
        let events = EventBus::new(metrics.clone());
        let runtime = RuntimeConfigHandle::new(config.runtime.clone());
        let coordinator =
            TransactionCoordinator::new(storage.clone(), config.coordinator.clone(), events, metrics.clone());

        let ledger = WalletLedger::new(storage.clone());
        let guard = ProfitGuard::new(storage.clone(), runtime.clone());
        let retention = RetentionEngine::new(ledger.clone(), metrics.clone());
        let settlement = SettlementEngine::new(
            coordinator.clone(),
            ledger.clone(),
            guard.clone(),
            retention.clone(),
            outcome,
            runtime.clone(),
            config.settlement.clone(),
            metrics.clone(),
        );
        let lottery = Arc::new(LotteryService::new(
            coordinator.clone(),
            ledger.clone(),
            guard.clone(),
            config.lottery.clone(),
            rng,
        ));

        tracing::info!(
            data_directory = %config.storage.data_directory,
            templates = config.lottery.templates.len(),
            "Platform opened"
        );

        Ok(Self {
            config,
            storage,
            coordinator,
            ledger,
            guard,
            retention,
            settlement,
            lottery,
            runtime,
            metrics,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storage(&self) -> &LedgerStorage {
        &self.storage
    }

    pub fn runtime(&self) -> &RuntimeConfigHandle {
        &self.runtime
    }

    pub fn lottery(&self) -> &Arc<LotteryService> {
        &self.lottery
    }

    pub fn settlement(&self) -> &SettlementEngine {
        &self.settlement
    }

    // Wallets

    pub fn create_wallet(&self, user_id: &str) -> LedgerResult<Wallet> {
        self.ledger.create_wallet(&self.coordinator, user_id)
    }

    pub fn wallet(&self, user_id: &str) -> LedgerResult<Wallet> {
        self.ledger.get(user_id)
    }

    pub fn deposit(&self, user_id: &str, balance: BalanceKind, amount: Amount) -> LedgerResult<Wallet> {
        self.ledger
            .deposit(&self.coordinator, user_id, balance, amount, "deposit")
    }

    pub fn withdraw(&self, user_id: &str, balance: BalanceKind, amount: Amount) -> LedgerResult<Wallet> {
        self.ledger
            .withdraw(&self.coordinator, user_id, balance, amount, "withdrawal")
    }

    pub fn transfer(&self, user_id: &str, from: BalanceKind, to: BalanceKind, amount: Amount) -> LedgerResult<Wallet> {
        self.ledger.transfer(&self.coordinator, user_id, from, to, amount)
    }

    /// Oldest first.
    pub fn history(&self, user_id: &str, limit: usize) -> LedgerResult<Vec<LogEntry>> {
        self.ledger.journal().history(user_id, limit)
    }

    pub fn reconcile(&self, user_id: &str) -> LedgerResult<Reconciliation> {
        let wallet = self.ledger.get(user_id)?;
        self.ledger.journal().reconcile(&wallet)
    }

    // Instant games

    pub fn settle_bet(&self, user_id: &str, bet: Amount, game: GameKind, round_id: &str) -> LedgerResult<SettlementResult> {
        self.settlement.settle_bet(user_id, bet, game, round_id)
    }

    pub fn cash_out(&self, user_id: &str, round_id: &str, multiplier: f64) -> LedgerResult<SettlementResult> {
        self.settlement.cash_out(user_id, round_id, multiplier)
    }

    pub fn round(&self, round_id: &str) -> LedgerResult<Option<RoundRecord>> {
        self.settlement.get_round(round_id)
    }

    pub fn safe_payout_pool(&self, game: Option<GameKind>) -> LedgerResult<PoolSnapshot> {
        self.guard
            .safe_payout_pool(game.map(|g| g.as_str()), crate::now_millis())
    }

    pub fn check_turnover_eligibility(&self, user_id: &str) -> LedgerResult<TurnoverStatus> {
        self.retention.check_turnover_eligibility(user_id)
    }

    // Lottery

    pub fn create_lottery_slot(&self, config: SlotConfig) -> LedgerResult<LotterySlot> {
        self.lottery.create_slot(config)
    }

    pub fn buy_ticket(&self, user_id: &str, quantity: u32, slot_id: &str) -> LedgerResult<PurchaseReceipt> {
        self.lottery.buy_ticket(user_id, quantity, slot_id)
    }

    pub fn force_draw(&self, slot_id: &str) -> LedgerResult<LotterySlot> {
        self.lottery.force_draw(slot_id)
    }

    pub fn manual_draw(&self, slot_id: &str, winner_user_id: &str) -> LedgerResult<LotterySlot> {
        self.lottery.manual_draw(slot_id, winner_user_id)
    }

    pub fn slot(&self, slot_id: &str) -> LedgerResult<Option<LotterySlot>> {
        self.lottery.get_slot(slot_id)
    }

    pub fn slot_tickets(&self, slot_id: &str) -> LedgerResult<Vec<Ticket>> {
        self.lottery.tickets(slot_id)
    }

    pub fn active_slots(&self, tier: Option<&str>) -> LedgerResult<Vec<LotterySlot>> {
        self.lottery.active_slots(tier)
    }

    pub fn run_lottery_tick(&self) -> LedgerResult<TickReport> {
        self.lottery.run_tick(crate::now_millis())
    }

    /// Spawn the draw scheduler on the current tokio runtime.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        DrawScheduler::spawn(self.lottery.clone())
    }

    // Observability

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.coordinator.events().subscribe()
    }

    pub fn metrics(&self) -> &Arc<LedgerMetrics> {
        &self.metrics
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.to_prometheus_format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::games::FixedOutcomeSource;

    fn platform(dir: &std::path::Path) -> Platform {
        let config = ConfigBuilder::new().data_directory(dir).build();
        Platform::open_with(config, Arc::new(FixedOutcomeSource::always_lose()), StdRng::seed_from_u64(1)).unwrap()
    }

    #[test]
    fn test_wallet_round_trip_through_platform() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform(dir.path());

        platform.create_wallet("u1").unwrap();
        platform.deposit("u1", BalanceKind::Main, Amount::units(50)).unwrap();
        platform
            .transfer("u1", BalanceKind::Main, BalanceKind::Game, Amount::units(20))
            .unwrap();

        let wallet = platform.wallet("u1").unwrap();
        assert_eq!(wallet.main, Amount::units(30));
        assert_eq!(wallet.game, Amount::units(20));
        assert_eq!(platform.history("u1", 10).unwrap().len(), 2);
        assert!(platform.reconcile("u1").unwrap().is_consistent());
    }

    #[test]
    fn test_losing_round_moves_pool() {
        let dir = tempfile::tempdir().unwrap();
        let platform = platform(dir.path());
        platform.create_wallet("u2").unwrap();
        platform.deposit("u2", BalanceKind::Game, Amount::units(10)).unwrap();

        let result = platform.settle_bet("u2", Amount::units(10), GameKind::Dice, "r-1").unwrap();
        assert!(!result.round.is_win());
        assert_eq!(result.game_balance, Amount::ZERO);

        let pool = platform.safe_payout_pool(None).unwrap();
        assert_eq!(pool.total_bets, Amount::units(10));
        assert!(platform.metrics_text().contains("casino_ledger_bets_settled_total 1"));
    }
}

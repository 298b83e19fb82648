//! Draw scheduler
//!
//! One task owns the timing of every slot: the periodic automation tick,
//! commands from purchases and admin calls, and the reveal deadlines of slots
//! in DRAWING. Pending reveals are keyed by slot id, so a slot is revealed
//! at most once per scheduler no matter how many triggers arrive.
//!
//! Draws and ticks run RocksDB transactions (lock waits, retry backoff), so
//! they go through `spawn_blocking` instead of running on the loop task.

use crate::lottery::service::LotteryService;
use crate::lottery::types::{LotterySlot, SlotStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// A purchase crossed the slot's sales target.
    SalesTargetReached(String),
    ForceDraw(String),
    Shutdown,
}

pub struct DrawScheduler {
    service: Arc<LotteryService>,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    pending: HashMap<String, Instant>,
}

/// Handle to a running scheduler task
pub struct SchedulerHandle {
    sender: mpsc::UnboundedSender<SchedulerCommand>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<SchedulerCommand> {
        self.sender.clone()
    }

    /// Stop the loop and wait for it to exit. Pending reveals are dropped;
    /// the next start or the stuck-draw recovery picks them up.
    pub async fn shutdown(self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Draw scheduler task failed");
        }
    }
}

impl DrawScheduler {
    /// Spawn the scheduler on the current runtime and attach it to `service`.
    pub fn spawn(service: Arc<LotteryService>) -> SchedulerHandle {
        let (sender, commands) = mpsc::unbounded_channel();
        if !service.attach_scheduler(sender.clone()) {
            tracing::warn!("A draw scheduler was already attached; purchases keep notifying the first one");
        }
        let scheduler = DrawScheduler {
            service,
            commands,
            pending: HashMap::new(),
        };
        let task = tokio::spawn(scheduler.run());
        SchedulerHandle { sender, task }
    }

    async fn run(mut self) {
        let config = self.service.config().clone();
        let mut tick = tokio::time::interval(config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.schedule_existing();
        tracing::info!(
            tick_secs = config.tick_interval_secs,
            reveal_delay_secs = config.reveal_delay_secs,
            pending = self.pending.len(),
            "Draw scheduler started"
        );

        loop {
            let next_reveal = self.pending.values().min().copied();
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                command = self.commands.recv() => match command {
                    Some(SchedulerCommand::SalesTargetReached(slot_id))
                    | Some(SchedulerCommand::ForceDraw(slot_id)) => self.schedule_by_id(&slot_id),
                    Some(SchedulerCommand::Shutdown) | None => break,
                },
                _ = tokio::time::sleep_until(next_reveal.unwrap_or_else(Instant::now)), if next_reveal.is_some() => {
                    self.reveal_due().await;
                }
            }
        }

        tracing::info!(pending = self.pending.len(), "Draw scheduler stopped");
    }

    fn schedule_existing(&mut self) {
        match self.service.store().by_status(SlotStatus::Drawing, None) {
            Ok(slots) => {
                for slot in slots {
                    self.schedule(&slot);
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to load slots awaiting reveal"),
        }
    }

    fn schedule_by_id(&mut self, slot_id: &str) {
        match self.service.get_slot(slot_id) {
            Ok(Some(slot)) => self.schedule(&slot),
            Ok(None) => tracing::warn!(slot_id, "Draw requested for unknown slot"),
            Err(e) => tracing::error!(slot_id, error = %e, "Failed to load slot for reveal"),
        }
    }

    fn schedule(&mut self, slot: &LotterySlot) {
        if slot.status != SlotStatus::Drawing || self.pending.contains_key(&slot.id) {
            return;
        }
        let delay_ms = self.service.config().reveal_delay().as_millis() as i64;
        let started = slot.draw_started_at.unwrap_or_else(crate::now_millis);
        let wait_ms = (started + delay_ms - crate::now_millis()).max(0) as u64;

        self.pending
            .insert(slot.id.clone(), Instant::now() + Duration::from_millis(wait_ms));
        tracing::debug!(slot_id = %slot.id, wait_ms, "Reveal scheduled");
    }

    async fn reveal_due(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(slot_id, _)| slot_id.clone())
            .collect();

        for slot_id in due {
            self.pending.remove(&slot_id);
            let service = self.service.clone();
            let id = slot_id.clone();
            match tokio::task::spawn_blocking(move || service.finalize(&id, crate::now_millis())).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(%slot_id, error = %e, "Reveal failed, left to stuck-draw recovery"),
                Err(e) => tracing::error!(%slot_id, error = %e, "Reveal task panicked"),
            }
        }
    }

    async fn on_tick(&mut self) {
        let service = self.service.clone();
        match tokio::task::spawn_blocking(move || service.run_tick(crate::now_millis())).await {
            Ok(Ok(report)) => {
                for slot in &report.promoted {
                    self.schedule(slot);
                }
                for slot_id in &report.recovered {
                    self.pending.remove(slot_id);
                }
                if !report.is_empty() {
                    tracing::info!(
                        recovered = report.recovered.len(),
                        promoted = report.promoted.len(),
                        created = report.created.len(),
                        "Lottery tick"
                    );
                }
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Lottery tick failed"),
            Err(e) => tracing::error!(error = %e, "Lottery tick task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::config::{CoordinatorConfig, LotteryConfig, RuntimeConfig, RuntimeConfigHandle};
    use crate::coordinator::TransactionCoordinator;
    use crate::events::EventBus;
    use crate::lottery::types::{PrizeTier, SlotConfig};
    use crate::metrics::LedgerMetrics;
    use crate::profit_guard::ProfitGuard;
    use crate::storage::LedgerStorage;
    use crate::wallet::{BalanceKind, WalletLedger};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn service(dir: &std::path::Path) -> (Arc<LotteryService>, TransactionCoordinator, WalletLedger) {
        let storage = LedgerStorage::open_path(dir).unwrap();
        let metrics = LedgerMetrics::new();
        let coordinator = TransactionCoordinator::new(
            storage.clone(),
            CoordinatorConfig::default(),
            EventBus::new(metrics.clone()),
            metrics,
        );
        let ledger = WalletLedger::new(storage.clone());
        let guard = ProfitGuard::new(storage, RuntimeConfigHandle::new(RuntimeConfig::default()));
        let config = LotteryConfig {
            tick_interval_secs: 3600,
            reveal_delay_secs: 0,
            templates: vec![],
            ..LotteryConfig::default()
        };
        let service = LotteryService::new(
            coordinator.clone(),
            ledger.clone(),
            guard,
            config,
            StdRng::seed_from_u64(11),
        );
        (Arc::new(service), coordinator, ledger)
    }

    #[tokio::test]
    async fn test_sales_target_reveals_through_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (service, coordinator, ledger) = service(dir.path());
        ledger.create_wallet(&coordinator, "ivy").unwrap();
        ledger
            .deposit(&coordinator, "ivy", BalanceKind::Main, Amount::units(100), "top up")
            .unwrap();

        let slot = service
            .create_slot(SlotConfig {
                tier: "mini".to_string(),
                ticket_price: Amount::units(10),
                target_sales: Amount::units(50),
                prizes: vec![PrizeTier {
                    name: "top".to_string(),
                    amount: Amount::units(40),
                    winners_count: 1,
                }],
                duration_secs: 600,
                starts_at: None,
            })
            .unwrap();

        let handle = DrawScheduler::spawn(service.clone());
        let receipt = service.buy_ticket("ivy", 5, &slot.id).unwrap();
        assert!(receipt.target_newly_reached);

        let mut status = SlotStatus::Drawing;
        for _ in 0..100 {
            status = service.get_slot(&slot.id).unwrap().unwrap().status;
            if status == SlotStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, SlotStatus::Completed);
        assert_eq!(ledger.get("ivy").unwrap().main, Amount::units(90));

        handle.shutdown().await;
    }
}

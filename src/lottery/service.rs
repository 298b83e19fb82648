//! Lottery slot lifecycle: creation, ticket sales and draws.
//!
//! Every state change goes through the coordinator, so concurrent buyers,
//! the scheduler and admin calls serialize on the slot row. Status moves
//! ACTIVE -> DRAWING -> COMPLETED and never back.

use crate::amount::Amount;
use crate::config::LotteryConfig;
use crate::coordinator::{Scope, TransactionCoordinator};
use crate::errors::{LedgerError, LedgerResult};
use crate::events::PlatformEvent;
use crate::journal::TxType;
use crate::lottery::draw::draw_winners;
use crate::lottery::scheduler::SchedulerCommand;
use crate::lottery::store::{LotteryStore, PurchaseRejection};
use crate::lottery::types::{
    LotterySlot, PurchaseReceipt, SlotConfig, SlotOrigin, SlotStatus, SlotTemplate, Ticket,
};
use crate::metrics::LedgerMetrics;
use crate::profit_guard::ProfitGuard;
use crate::storage::validate_id;
use crate::wallet::{BalanceKind, Posting, WalletLedger};
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;

/// Stats scope for ticket sales and prizes.
pub const LOTTERY_SCOPE: &str = "lottery";

/// What one automation tick did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Stuck DRAWING slots finalized.
    pub recovered: Vec<String>,
    /// Expired or sold-out ACTIVE slots moved to DRAWING.
    pub promoted: Vec<LotterySlot>,
    pub created: Vec<LotterySlot>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.promoted.is_empty() && self.created.is_empty()
    }
}

pub struct LotteryService {
    coordinator: TransactionCoordinator,
    ledger: WalletLedger,
    guard: ProfitGuard,
    store: LotteryStore,
    config: LotteryConfig,
    metrics: Arc<LedgerMetrics>,
    rng: Mutex<StdRng>,
    scheduler: OnceLock<mpsc::UnboundedSender<SchedulerCommand>>,
}

impl LotteryService {
    pub fn new(
        coordinator: TransactionCoordinator,
        ledger: WalletLedger,
        guard: ProfitGuard,
        config: LotteryConfig,
        rng: StdRng,
    ) -> Self {
        let store = LotteryStore::new(coordinator.storage().clone());
        let metrics = coordinator.metrics().clone();
        Self {
            coordinator,
            ledger,
            guard,
            store,
            config,
            metrics,
            rng: Mutex::new(rng),
            scheduler: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &LotteryConfig {
        &self.config
    }

    pub fn store(&self) -> &LotteryStore {
        &self.store
    }

    /// Route draw notifications to a running scheduler. Only the first
    /// attached scheduler is kept.
    pub fn attach_scheduler(&self, sender: mpsc::UnboundedSender<SchedulerCommand>) -> bool {
        self.scheduler.set(sender).is_ok()
    }

    fn notify(&self, command: SchedulerCommand) {
        if let Some(sender) = self.scheduler.get() {
            if sender.send(command).is_err() {
                tracing::warn!("Draw scheduler is gone, reveal left to the watchdog");
            }
        }
    }

    pub fn get_slot(&self, slot_id: &str) -> LedgerResult<Option<LotterySlot>> {
        self.store.get(slot_id)
    }

    pub fn tickets(&self, slot_id: &str) -> LedgerResult<Vec<Ticket>> {
        self.store.tickets(slot_id)
    }

    pub fn active_slots(&self, tier: Option<&str>) -> LedgerResult<Vec<LotterySlot>> {
        let mut slots = self.store.by_status(SlotStatus::Active, tier)?;
        slots.sort_by_key(|s| s.end_time);
        Ok(slots)
    }

    /// Admin slot creation.
    pub fn create_slot(&self, config: SlotConfig) -> LedgerResult<LotterySlot> {
        validate_slot_config(&config, self.config.purchase_lock_window_secs)?;
        let now = crate::now_millis();
        let slot = self.coordinator.execute("create_slot", |scope| {
            self.store.lock_tier(scope, &config.tier)?;
            self.insert_slot(scope, &config, SlotOrigin::Admin, now)
        })?;
        self.created(&slot);
        Ok(slot)
    }

    fn insert_slot(
        &self,
        scope: &mut Scope<'_>,
        config: &SlotConfig,
        origin: SlotOrigin,
        now: i64,
    ) -> LedgerResult<LotterySlot> {
        let start_time = config.starts_at.unwrap_or(now);
        let slot = LotterySlot {
            id: uuid::Uuid::new_v4().to_string(),
            tier: config.tier.clone(),
            status: SlotStatus::Active,
            origin,
            prizes: config.prizes.clone(),
            ticket_price: config.ticket_price,
            current_sales: Amount::ZERO,
            target_sales: config.target_sales,
            ticket_count: 0,
            winners: Vec::new(),
            skipped_prizes: Vec::new(),
            start_time,
            end_time: start_time + (config.duration_secs as i64) * 1000,
            draw_started_at: None,
            completed_at: None,
        };
        self.store.insert(scope, &slot)?;
        scope.emit(update_event(&slot));
        Ok(slot)
    }

    fn created(&self, slot: &LotterySlot) {
        LedgerMetrics::inc(&self.metrics.slots_created_total);
        tracing::info!(
            slot_id = %slot.id,
            tier = %slot.tier,
            origin = ?slot.origin,
            end_time = slot.end_time,
            "Lottery slot created"
        );
    }

    pub fn buy_ticket(&self, user_id: &str, quantity: u32, slot_id: &str) -> LedgerResult<PurchaseReceipt> {
        self.buy_ticket_at(user_id, quantity, slot_id, crate::now_millis())
    }

    /// Purchase at an explicit clock reading.
    pub fn buy_ticket_at(
        &self,
        user_id: &str,
        quantity: u32,
        slot_id: &str,
        now: i64,
    ) -> LedgerResult<PurchaseReceipt> {
        validate_id("user id", user_id)?;
        if quantity == 0 || quantity > self.config.max_tickets_per_purchase {
            return Err(LedgerError::invalid(format!(
                "ticket quantity must be 1..={}, got {}",
                self.config.max_tickets_per_purchase, quantity
            )));
        }
        let lock_window_ms = (self.config.purchase_lock_window_secs as i64) * 1000;

        let outcome = self.coordinator.execute("buy_ticket", |scope| {
            let mut slot = self.store.load_for_update(scope, slot_id)?;
            if slot.status != SlotStatus::Active {
                return Err(LedgerError::slot_closed(slot_id, format!("slot is {}", slot.status)));
            }
            if now < slot.start_time {
                return Err(LedgerError::slot_closed(slot_id, "slot has not opened yet"));
            }
            if now >= slot.end_time {
                return Err(LedgerError::slot_closed(slot_id, "slot has ended"));
            }
            if now >= slot.end_time - lock_window_ms {
                return Err(LedgerError::slot_closed(slot_id, "purchase window closed before draw"));
            }

            let cost = slot
                .ticket_price
                .checked_mul_int(quantity as u64)
                .ok_or_else(|| LedgerError::invalid("ticket cost overflow"))?;
            let posting = Posting::new(TxType::TicketPurchase, format!("{} x {} ticket", quantity, slot.tier))
                .delta(BalanceKind::Main, -cost)
                .reference(slot_id);
            self.ledger.mutate(scope, user_id, posting)?;

            let was_reached = slot.target_reached();
            let first = slot.ticket_count + 1;
            let ticket_numbers: Vec<u64> = (first..first + quantity as u64).collect();
            let tickets: Vec<Ticket> = ticket_numbers
                .iter()
                .map(|&ticket_no| Ticket {
                    ticket_no,
                    user_id: user_id.to_string(),
                    purchased_at: now,
                })
                .collect();
            self.store.put_tickets(scope, slot_id, &tickets)?;
            slot.ticket_count += quantity as u64;
            slot.current_sales = slot
                .current_sales
                .checked_add(cost)
                .ok_or_else(|| LedgerError::invalid("slot sales overflow"))?;

            self.guard.record(scope, LOTTERY_SCOPE, user_id, cost, Amount::ZERO, 0)?;
            self.store.update(scope, &slot, SlotStatus::Active)?;
            scope.emit(update_event(&slot));

            let receipt = PurchaseReceipt {
                slot_id: slot_id.to_string(),
                user_id: user_id.to_string(),
                ticket_numbers,
                cost,
                current_sales: slot.current_sales,
                target_newly_reached: !was_reached && slot.target_reached(),
            };
            Ok((receipt, slot.target_reached()))
        });

        let (receipt, target_reached) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if let LedgerError::SlotClosedOrInvalid { reason, .. } = &e {
                    self.reject(slot_id, user_id, quantity, reason, now);
                }
                return Err(e);
            }
        };

        LedgerMetrics::add(&self.metrics.tickets_sold_total, quantity as u64);
        tracing::debug!(
            user_id,
            slot_id,
            quantity,
            current_sales = %receipt.current_sales,
            "Tickets purchased"
        );

        // A slot still ACTIVE past its target means an earlier draw start
        // failed; every later purchase tries again.
        if target_reached {
            if receipt.target_newly_reached {
                tracing::info!(slot_id, current_sales = %receipt.current_sales, "Sales target reached");
            } else {
                tracing::warn!(slot_id, current_sales = %receipt.current_sales, "Retrying draw start for sold-out slot");
            }
            match self.begin_draw(slot_id, now) {
                Ok(_) => self.notify(SchedulerCommand::SalesTargetReached(slot_id.to_string())),
                Err(e) => tracing::warn!(slot_id, error = %e, "Draw start after sales target failed"),
            }
        }
        Ok(receipt)
    }

    fn reject(&self, slot_id: &str, user_id: &str, quantity: u32, reason: &str, now: i64) {
        LedgerMetrics::inc(&self.metrics.purchases_rejected_total);
        tracing::warn!(slot_id, user_id, quantity, reason, "Ticket purchase rejected");
        self.store.record_rejection(&PurchaseRejection {
            slot_id: slot_id.to_string(),
            user_id: user_id.to_string(),
            quantity,
            reason: reason.to_string(),
            at: now,
        });
    }

    /// ACTIVE -> DRAWING. A slot already DRAWING is returned unchanged.
    pub fn begin_draw(&self, slot_id: &str, now: i64) -> LedgerResult<LotterySlot> {
        let reveal_delay_ms = self.config.reveal_delay().as_millis() as i64;
        let (slot, transitioned) = self.coordinator.execute("begin_draw", |scope| {
            let mut slot = self.store.load_for_update(scope, slot_id)?;
            match slot.status {
                SlotStatus::Drawing => return Ok((slot, false)),
                SlotStatus::Completed => {
                    return Err(LedgerError::slot_closed(slot_id, "slot is already completed"))
                }
                SlotStatus::Active => {}
            }

            slot.status = SlotStatus::Drawing;
            slot.draw_started_at = Some(now);
            self.store.update(scope, &slot, SlotStatus::Active)?;

            scope.emit(PlatformEvent::LotteryDrawStart {
                slot_id: slot.id.clone(),
                tier: slot.tier.clone(),
                reveal_at: now + reveal_delay_ms,
            });
            scope.emit(update_event(&slot));
            Ok((slot, true))
        })?;

        if transitioned {
            tracing::info!(
                slot_id,
                tier = %slot.tier,
                tickets = slot.tickets_sold(),
                current_sales = %slot.current_sales,
                "Slot locked for drawing"
            );
        }
        Ok(slot)
    }

    /// Admin trigger: start drawing now and let the scheduler reveal.
    pub fn force_draw(&self, slot_id: &str) -> LedgerResult<LotterySlot> {
        let slot = self.begin_draw(slot_id, crate::now_millis())?;
        self.notify(SchedulerCommand::ForceDraw(slot_id.to_string()));
        Ok(slot)
    }

    /// DRAWING -> COMPLETED. Completing an already completed slot is a no-op.
    pub fn finalize(&self, slot_id: &str, now: i64) -> LedgerResult<LotterySlot> {
        self.complete(slot_id, None, now).map(|(slot, _)| slot)
    }

    /// Admin finalization with `winner_user_id` taking the top prize. An
    /// ACTIVE slot is moved to DRAWING first, then drawn at once.
    pub fn manual_draw(&self, slot_id: &str, winner_user_id: &str) -> LedgerResult<LotterySlot> {
        validate_id("user id", winner_user_id)?;
        let now = crate::now_millis();
        let slot = self
            .store
            .get(slot_id)?
            .ok_or_else(|| LedgerError::slot_closed(slot_id, "slot not found"))?;
        if slot.status == SlotStatus::Completed {
            return Err(LedgerError::slot_closed(slot_id, "slot is already completed"));
        }
        // Tickets are never removed, so ownership checked here still holds
        // when the draw runs.
        if !self.store.tickets(slot_id)?.iter().any(|t| t.user_id == winner_user_id) {
            return Err(LedgerError::invalid(format!(
                "user {} holds no ticket in slot {}",
                winner_user_id, slot_id
            )));
        }
        if slot.status == SlotStatus::Active {
            self.begin_draw(slot_id, now)?;
        }
        self.complete(slot_id, Some(winner_user_id), now)
            .map(|(slot, _)| slot)
    }

    fn complete(
        &self,
        slot_id: &str,
        forced_winner: Option<&str>,
        now: i64,
    ) -> LedgerResult<(LotterySlot, bool)> {
        let rule = self.config.funding_rule;
        let (slot, completed_now) = self.coordinator.execute("finalize_slot", |scope| {
            let mut slot = self.store.load_for_update(scope, slot_id)?;
            let previous = slot.status;
            match (previous, forced_winner) {
                (SlotStatus::Completed, None) => return Ok((slot, false)),
                (SlotStatus::Completed, Some(_)) => {
                    return Err(LedgerError::slot_closed(slot_id, "slot is already completed"))
                }
                (SlotStatus::Active, _) => {
                    return Err(LedgerError::slot_closed(slot_id, "slot is still selling tickets"))
                }
                (SlotStatus::Drawing, _) => {}
            }

            // The slot row is held, so no purchase can add tickets meanwhile.
            let tickets = self.store.tickets(slot_id)?;
            if tickets.len() as u64 != slot.ticket_count {
                return Err(LedgerError::Storage(format!(
                    "slot {} lists {} tickets but {} are stored",
                    slot_id,
                    slot.ticket_count,
                    tickets.len()
                )));
            }

            let result = {
                let mut rng = self
                    .rng
                    .lock()
                    .map_err(|_| LedgerError::Storage("draw rng poisoned".to_string()))?;
                draw_winners(&slot, tickets, rule, forced_winner, &mut *rng)?
            };

            for winner in &result.winners {
                let posting = Posting::new(
                    TxType::LotteryWin,
                    format!("{} prize in {} slot", winner.prize_name, slot.tier),
                )
                .delta(BalanceKind::Main, winner.amount)
                .reference(slot_id);
                self.ledger.mutate(scope, &winner.user_id, posting)?;
                scope.emit(PlatformEvent::LotteryWin {
                    slot_id: slot.id.clone(),
                    user_id: winner.user_id.clone(),
                    ticket_no: winner.ticket_no,
                    prize_name: winner.prize_name.clone(),
                    amount: winner.amount,
                });
            }

            let paid = result.total_paid();
            if paid.is_positive() {
                self.guard.record(scope, LOTTERY_SCOPE, slot_id, Amount::ZERO, paid, 0)?;
            }

            slot.winners = result.winners;
            slot.skipped_prizes = result.skipped;
            slot.status = SlotStatus::Completed;
            slot.draw_started_at.get_or_insert(now);
            slot.completed_at = Some(now);
            self.store.update(scope, &slot, previous)?;
            scope.emit(update_event(&slot));
            Ok((slot, true))
        })?;

        if completed_now {
            LedgerMetrics::inc(&self.metrics.draws_completed_total);
            LedgerMetrics::add(&self.metrics.prizes_paid_total, slot.winners.len() as u64);
            LedgerMetrics::add(&self.metrics.prizes_skipped_total, slot.skipped_prizes.len() as u64);
            for skipped in &slot.skipped_prizes {
                tracing::warn!(
                    slot_id,
                    prize = %skipped.prize_name,
                    amount = %skipped.amount,
                    funded_by = %skipped.funded_by,
                    "Prize not funded by sales, skipped"
                );
            }
            tracing::info!(
                slot_id,
                tier = %slot.tier,
                winners = slot.winners.len(),
                skipped = slot.skipped_prizes.len(),
                manual = forced_winner.is_some(),
                "Slot drawn"
            );
        }
        Ok((slot, completed_now))
    }

    /// One automation pass: recover stuck draws, promote expired or sold-out
    /// slots and keep every template tier supplied with a slot. Failures on one slot
    /// are logged and do not stop the rest of the pass.
    pub fn run_tick(&self, now: i64) -> LedgerResult<TickReport> {
        let mut report = TickReport::default();
        let grace_ms = (self.config.stuck_grace_secs as i64) * 1000;

        for slot in self.store.by_status(SlotStatus::Drawing, None)? {
            let started = slot.draw_started_at.unwrap_or(slot.end_time);
            if now - started < grace_ms {
                continue;
            }
            match self.complete(&slot.id, None, now) {
                Ok((_, true)) => {
                    LedgerMetrics::inc(&self.metrics.slots_recovered_total);
                    tracing::warn!(slot_id = %slot.id, stuck_ms = now - started, "Recovered stuck draw");
                    report.recovered.push(slot.id);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(slot_id = %slot.id, error = %e, "Stuck draw recovery failed"),
            }
        }

        let mut due = self.store.expired_active(now)?;
        for slot in self.store.by_status(SlotStatus::Active, None)? {
            if slot.target_reached() && !due.contains(&slot.id) {
                tracing::warn!(slot_id = %slot.id, "Sold-out slot still ACTIVE, promoting");
                due.push(slot.id);
            }
        }
        for slot_id in due {
            match self.begin_draw(&slot_id, now) {
                Ok(slot) => report.promoted.push(slot),
                Err(e) => tracing::error!(%slot_id, error = %e, "Slot promotion failed"),
            }
        }

        for template in &self.config.templates {
            match self.ensure_slot(template, now) {
                Ok(Some(slot)) => report.created.push(slot),
                Ok(None) => {}
                Err(e) => tracing::error!(tier = %template.tier, error = %e, "Slot auto-creation failed"),
            }
        }

        Ok(report)
    }

    /// Create the next slot for a template tier if it has none.
    fn ensure_slot(&self, template: &SlotTemplate, now: i64) -> LedgerResult<Option<LotterySlot>> {
        if !template.auto_renew && !template.critical {
            return Ok(None);
        }
        let config = template.to_slot_config();
        validate_slot_config(&config, self.config.purchase_lock_window_secs)?;
        let created = self.coordinator.execute("ensure_slot", |scope| {
            self.store.lock_tier(scope, &template.tier)?;
            let active = self.store.by_status(SlotStatus::Active, Some(&template.tier))?;
            if !active.is_empty() {
                return Ok(None);
            }
            let drawing = self.store.by_status(SlotStatus::Drawing, Some(&template.tier))?;

            let origin = if template.auto_renew && drawing.is_empty() {
                SlotOrigin::Scheduler
            } else if template.critical {
                SlotOrigin::Watchdog
            } else {
                return Ok(None);
            };
            self.insert_slot(scope, &config, origin, now).map(Some)
        })?;

        if let Some(slot) = &created {
            self.created(slot);
        }
        Ok(created)
    }

    pub fn rejections(&self, limit: usize) -> LedgerResult<Vec<PurchaseRejection>> {
        self.store.rejections(limit)
    }
}

fn update_event(slot: &LotterySlot) -> PlatformEvent {
    PlatformEvent::LotteryUpdate {
        slot_id: slot.id.clone(),
        tier: slot.tier.clone(),
        status: slot.status,
        current_sales: slot.current_sales,
        target_sales: slot.target_sales,
        tickets_sold: slot.tickets_sold(),
    }
}

fn validate_slot_config(config: &SlotConfig, lock_window_secs: u64) -> LedgerResult<()> {
    validate_id("tier", &config.tier)?;
    if !config.ticket_price.is_positive() {
        return Err(LedgerError::invalid("ticket price must be positive"));
    }
    if !config.target_sales.is_positive() {
        return Err(LedgerError::invalid("target sales must be positive"));
    }
    if config.duration_secs <= lock_window_secs {
        return Err(LedgerError::invalid(format!(
            "slot duration {}s must exceed the {}s purchase lock window",
            config.duration_secs, lock_window_secs
        )));
    }
    if config.prizes.is_empty() {
        return Err(LedgerError::invalid("slot needs at least one prize tier"));
    }
    for prize in &config.prizes {
        if !prize.amount.is_positive() || prize.winners_count == 0 {
            return Err(LedgerError::invalid(format!(
                "prize tier '{}' needs a positive amount and at least one winner",
                prize.name
            )));
        }
    }
    Ok(())
}

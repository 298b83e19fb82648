//! Persistent lottery slots stored in RocksDB.
//!
//! A slot is one JSON document holding counters and results. Tickets are
//! written once each under `lottery:ticket:<slot_id>:<ticket_no>`, so a
//! purchase only touches the slot row and its own tickets. Two indexes are
//! kept in the same scope as every slot write:
//! - `lottery:idx:status:<STATUS>:<tier>:<slot_id>` for per-tier lookups
//! - `lottery:idx:end:<end_time>:<slot_id>` for ACTIVE slots only, scanned by
//!   the tick to find expired ones

use crate::coordinator::Scope;
use crate::errors::{LedgerError, LedgerResult};
use crate::lottery::types::{LotterySlot, SlotStatus, Ticket};
use crate::storage::{decode, last_component, ts_component, LedgerStorage};
use serde::{Deserialize, Serialize};

const SLOT_PREFIX: &str = "lottery:slot:";
const TICKET_PREFIX: &str = "lottery:ticket:";
const STATUS_INDEX_PREFIX: &str = "lottery:idx:status:";
const END_INDEX_PREFIX: &str = "lottery:idx:end:";
const TIER_LOCK_PREFIX: &str = "lottery:tier:";
const PURCHASE_AUDIT_PREFIX: &str = "audit:purchase:";

const INDEX_SCAN_LIMIT: usize = 10_000;

fn slot_key(slot_id: &str) -> String {
    format!("{}{}", SLOT_PREFIX, slot_id)
}

fn ticket_prefix(slot_id: &str) -> String {
    format!("{}{}:", TICKET_PREFIX, slot_id)
}

fn ticket_key(slot_id: &str, ticket_no: u64) -> String {
    format!("{}{:020}", ticket_prefix(slot_id), ticket_no)
}

fn status_index_key(status: SlotStatus, tier: &str, slot_id: &str) -> String {
    format!("{}{}:{}:{}", STATUS_INDEX_PREFIX, status, tier, slot_id)
}

fn end_index_key(end_time: i64, slot_id: &str) -> String {
    format!("{}{}:{}", END_INDEX_PREFIX, ts_component(end_time), slot_id)
}

/// Audit record for a rejected ticket purchase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseRejection {
    pub slot_id: String,
    pub user_id: String,
    pub quantity: u32,
    pub reason: String,
    pub at: i64,
}

#[derive(Clone)]
pub struct LotteryStore {
    storage: LedgerStorage,
}

impl LotteryStore {
    pub fn new(storage: LedgerStorage) -> Self {
        Self { storage }
    }

    /// Serialize slot creation per tier for the rest of the scope.
    pub fn lock_tier(&self, scope: &Scope<'_>, tier: &str) -> LedgerResult<u64> {
        let key = format!("{}{}", TIER_LOCK_PREFIX, tier);
        let generation = scope.get_for_update::<u64>(&key)?.unwrap_or(0) + 1;
        scope.put(&key, &generation)?;
        Ok(generation)
    }

    pub fn insert(&self, scope: &Scope<'_>, slot: &LotterySlot) -> LedgerResult<()> {
        scope.put(&slot_key(&slot.id), slot)?;
        scope.put_marker(&status_index_key(slot.status, &slot.tier, &slot.id))?;
        if slot.status == SlotStatus::Active {
            scope.put_marker(&end_index_key(slot.end_time, &slot.id))?;
        }
        Ok(())
    }

    pub fn load_for_update(&self, scope: &Scope<'_>, slot_id: &str) -> LedgerResult<LotterySlot> {
        scope
            .get_for_update(&slot_key(slot_id))?
            .ok_or_else(|| LedgerError::slot_closed(slot_id, "slot not found"))
    }

    /// Write back a slot loaded in this scope; `previous` is its status at load.
    pub fn update(&self, scope: &Scope<'_>, slot: &LotterySlot, previous: SlotStatus) -> LedgerResult<()> {
        if previous != slot.status {
            if !previous.can_advance_to(slot.status) {
                return Err(LedgerError::slot_closed(
                    &slot.id,
                    format!("illegal transition {} -> {}", previous, slot.status),
                ));
            }
            scope.delete(&status_index_key(previous, &slot.tier, &slot.id))?;
            scope.put_marker(&status_index_key(slot.status, &slot.tier, &slot.id))?;
            if previous == SlotStatus::Active {
                scope.delete(&end_index_key(slot.end_time, &slot.id))?;
            }
        }
        scope.put(&slot_key(&slot.id), slot)
    }

    /// Write freshly issued tickets. The caller holds the slot row.
    pub fn put_tickets(&self, scope: &Scope<'_>, slot_id: &str, tickets: &[Ticket]) -> LedgerResult<()> {
        for ticket in tickets {
            scope.put(&ticket_key(slot_id, ticket.ticket_no), ticket)?;
        }
        Ok(())
    }

    /// Committed tickets of a slot in ticket-number order.
    pub fn tickets(&self, slot_id: &str) -> LedgerResult<Vec<Ticket>> {
        self.storage
            .scan_prefix(ticket_prefix(slot_id).as_bytes(), None, usize::MAX)?
            .into_iter()
            .map(|(key, value)| decode(&key, &value))
            .collect()
    }

    pub fn get(&self, slot_id: &str) -> LedgerResult<Option<LotterySlot>> {
        self.storage.get_json(slot_key(slot_id).as_bytes())
    }

    /// Committed slots in `status`, optionally limited to one tier.
    pub fn by_status(&self, status: SlotStatus, tier: Option<&str>) -> LedgerResult<Vec<LotterySlot>> {
        let prefix = match tier {
            Some(tier) => format!("{}{}:{}:", STATUS_INDEX_PREFIX, status, tier),
            None => format!("{}{}:", STATUS_INDEX_PREFIX, status),
        };

        let mut slots = Vec::new();
        for key in self.storage.scan_keys(prefix.as_bytes(), INDEX_SCAN_LIMIT)? {
            let slot_id = last_component(&key);
            match self.get(slot_id)? {
                Some(slot) if slot.status == status => slots.push(slot),
                Some(_) => {}
                None => tracing::warn!(index = %key, "Status index points at missing slot"),
            }
        }
        Ok(slots)
    }

    /// Ids of ACTIVE slots whose `end_time` is at or before `now`.
    pub fn expired_active(&self, now: i64) -> LedgerResult<Vec<String>> {
        let cutoff = ts_component(now);
        let mut ids = Vec::new();
        for key in self.storage.scan_keys(END_INDEX_PREFIX.as_bytes(), INDEX_SCAN_LIMIT)? {
            let rest = &key[END_INDEX_PREFIX.len()..];
            let Some((end, slot_id)) = rest.split_once(':') else {
                continue;
            };
            if end > cutoff.as_str() {
                break;
            }
            ids.push(slot_id.to_string());
        }
        Ok(ids)
    }

    /// Audit writes never fail the caller.
    pub fn record_rejection(&self, rejection: &PurchaseRejection) {
        let key = format!(
            "{}{}:{}",
            PURCHASE_AUDIT_PREFIX,
            ts_component(rejection.at),
            uuid::Uuid::new_v4()
        );
        if let Err(e) = self.storage.put_json(key.as_bytes(), rejection) {
            tracing::warn!(error = %e, slot_id = %rejection.slot_id, "Failed to write purchase audit record");
        }
    }

    pub fn rejections(&self, limit: usize) -> LedgerResult<Vec<PurchaseRejection>> {
        self.storage
            .scan_prefix(PURCHASE_AUDIT_PREFIX.as_bytes(), None, limit)?
            .into_iter()
            .map(|(key, value)| decode(&key, &value))
            .collect()
    }
}

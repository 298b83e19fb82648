use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lottery slot lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Active,
    Drawing,
    Completed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Active => "ACTIVE",
            SlotStatus::Drawing => "DRAWING",
            SlotStatus::Completed => "COMPLETED",
        }
    }

    /// Whether `next` is a legal forward step from `self`. Every slot passes
    /// through DRAWING, manual draws included.
    pub fn can_advance_to(&self, next: SlotStatus) -> bool {
        matches!(
            (self, next),
            (SlotStatus::Active, SlotStatus::Drawing) | (SlotStatus::Drawing, SlotStatus::Completed)
        )
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created a slot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotOrigin {
    Scheduler,
    Watchdog,
    Admin,
}

/// How prize tiers are checked against ticket sales at finalize time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FundingRule {
    /// Each tier is compared against total sales.
    #[default]
    TotalSales,
    /// Each tier is compared against sales minus prizes already credited.
    RemainingSales,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrizeTier {
    pub name: String,
    pub amount: Amount,
    pub winners_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub ticket_no: u64,
    pub user_id: String,
    pub purchased_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Winner {
    pub user_id: String,
    pub ticket_no: u64,
    pub prize_name: String,
    pub amount: Amount,
}

/// A drawn winner whose tier was not funded by sales
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedPrize {
    pub user_id: String,
    pub ticket_no: u64,
    pub prize_name: String,
    pub amount: Amount,
    pub funded_by: Amount,
}

/// One lottery draw cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotterySlot {
    pub id: String,
    pub tier: String,
    pub status: SlotStatus,
    pub origin: SlotOrigin,
    pub prizes: Vec<PrizeTier>,
    pub ticket_price: Amount,
    pub current_sales: Amount,
    pub target_sales: Amount,
    /// Tickets live under their own keys; this is the highest number issued.
    #[serde(default)]
    pub ticket_count: u64,
    #[serde(default)]
    pub winners: Vec<Winner>,
    #[serde(default)]
    pub skipped_prizes: Vec<SkippedPrize>,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draw_started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl LotterySlot {
    pub fn tickets_sold(&self) -> usize {
        self.ticket_count as usize
    }

    pub fn target_reached(&self) -> bool {
        self.current_sales >= self.target_sales
    }
}

/// Parameters for creating a slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub tier: String,
    pub ticket_price: Amount,
    pub target_sales: Amount,
    pub prizes: Vec<PrizeTier>,
    pub duration_secs: u64,
    /// Defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<i64>,
}

/// Recurring slot definition for one tier, used by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotTemplate {
    pub tier: String,
    pub ticket_price: Amount,
    pub target_sales: Amount,
    pub duration_secs: u64,
    /// Re-created by the tick once the previous cycle completes.
    #[serde(default = "default_true")]
    pub auto_renew: bool,
    /// Watchdog keeps at least one ACTIVE slot for this tier at all times.
    #[serde(default)]
    pub critical: bool,
    pub prizes: Vec<PrizeTier>,
}

fn default_true() -> bool {
    true
}

impl SlotTemplate {
    pub fn to_slot_config(&self) -> SlotConfig {
        SlotConfig {
            tier: self.tier.clone(),
            ticket_price: self.ticket_price,
            target_sales: self.target_sales,
            prizes: self.prizes.clone(),
            duration_secs: self.duration_secs,
            starts_at: None,
        }
    }

    /// Default tiers: a fast sales-triggered draw and an hourly draw.
    pub fn defaults() -> Vec<SlotTemplate> {
        vec![
            SlotTemplate {
                tier: "quick".to_string(),
                ticket_price: Amount::units(20),
                target_sales: Amount::units(1000),
                duration_secs: 15 * 60,
                prizes: vec![
                    PrizeTier {
                        name: "grand".to_string(),
                        amount: Amount::units(500),
                        winners_count: 1,
                    },
                    PrizeTier {
                        name: "second".to_string(),
                        amount: Amount::units(100),
                        winners_count: 2,
                    },
                    PrizeTier {
                        name: "third".to_string(),
                        amount: Amount::units(20),
                        winners_count: 5,
                    },
                ],
                auto_renew: true,
                critical: true,
            },
            SlotTemplate {
                tier: "hourly".to_string(),
                ticket_price: Amount::units(50),
                target_sales: Amount::units(10_000),
                duration_secs: 60 * 60,
                prizes: vec![
                    PrizeTier {
                        name: "jackpot".to_string(),
                        amount: Amount::units(5000),
                        winners_count: 1,
                    },
                    PrizeTier {
                        name: "runner_up".to_string(),
                        amount: Amount::units(500),
                        winners_count: 3,
                    },
                ],
                auto_renew: true,
                critical: false,
            },
        ]
    }
}

/// Result of a ticket purchase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub slot_id: String,
    pub user_id: String,
    pub ticket_numbers: Vec<u64>,
    pub cost: Amount,
    pub current_sales: Amount,
    /// True only for the purchase that crossed the target.
    pub target_newly_reached: bool,
}

//! Platform event fan-out
//!
//! Events are published only after the coordinator scope that produced them
//! has committed. Delivery is fire-and-forget: a send with no subscribers, or
//! a lagging subscriber, never affects the ledger.

use crate::amount::Amount;
use crate::metrics::LedgerMetrics;
use crate::lottery::types::SlotStatus;
use crate::wallet::BalanceKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    WalletUpdate {
        user_id: String,
        balance: BalanceKind,
        amount: Amount,
        balance_after: Amount,
        reference: Option<String>,
        timestamp: i64,
    },
    LotteryUpdate {
        slot_id: String,
        tier: String,
        status: SlotStatus,
        current_sales: Amount,
        target_sales: Amount,
        tickets_sold: usize,
    },
    LotteryDrawStart {
        slot_id: String,
        tier: String,
        reveal_at: i64,
    },
    LotteryWin {
        slot_id: String,
        user_id: String,
        ticket_no: u64,
        prize_name: String,
        amount: Amount,
    },
}

impl PlatformEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformEvent::WalletUpdate { .. } => "wallet_update",
            PlatformEvent::LotteryUpdate { .. } => "lottery_update",
            PlatformEvent::LotteryDrawStart { .. } => "lottery_draw_start",
            PlatformEvent::LotteryWin { .. } => "lottery_win",
        }
    }
}

/// Broadcast sender shared by every component
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
    metrics: Arc<LedgerMetrics>,
}

impl EventBus {
    pub fn new(metrics: Arc<LedgerMetrics>) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, metrics)
    }

    pub fn with_capacity(capacity: usize, metrics: Arc<LedgerMetrics>) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, metrics }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: PlatformEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => {
                LedgerMetrics::inc(&self.metrics.events_published_total);
                tracing::trace!(event = name, receivers, "Event published");
            }
            Err(_) => tracing::trace!(event = name, "No event subscribers"),
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = PlatformEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(LedgerMetrics::new());
        let mut rx = bus.subscribe();

        bus.publish(PlatformEvent::LotteryDrawStart {
            slot_id: "s1".to_string(),
            tier: "quick".to_string(),
            reveal_at: 7_000,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "lottery_draw_start");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let metrics = LedgerMetrics::new();
        let bus = EventBus::new(metrics.clone());
        bus.publish(PlatformEvent::LotteryDrawStart {
            slot_id: "s1".to_string(),
            tier: "quick".to_string(),
            reveal_at: 0,
        });
        assert_eq!(LedgerMetrics::get(&metrics.events_published_total), 0);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = PlatformEvent::LotteryWin {
            slot_id: "s1".to_string(),
            user_id: "alice".to_string(),
            ticket_no: 4,
            prize_name: "grand".to_string(),
            amount: Amount::units(500),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lottery_win");
        assert_eq!(json["amount"], "500.000000");
    }
}

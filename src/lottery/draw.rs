//! Winner selection for a lottery slot. Pure apart from the injected RNG.

use crate::amount::Amount;
use crate::errors::{LedgerError, LedgerResult};
use crate::lottery::types::{FundingRule, LotterySlot, PrizeTier, SkippedPrize, Ticket, Winner};
use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawResult {
    pub winners: Vec<Winner>,
    pub skipped: Vec<SkippedPrize>,
}

impl DrawResult {
    pub fn total_paid(&self) -> Amount {
        self.winners.iter().map(|w| w.amount).sum()
    }
}

/// Shuffle the tickets (Fisher-Yates) and walk prize tiers from the highest
/// amount down, popping `winners_count` tickets per tier. A tier whose amount
/// exceeds what the funding rule allows is skipped for that ticket.
///
/// With `forced_winner`, one of that user's tickets takes the first prize
/// drawn; the user must hold a ticket.
pub fn draw_winners<R: Rng + ?Sized>(
    slot: &LotterySlot,
    tickets: Vec<Ticket>,
    rule: FundingRule,
    forced_winner: Option<&str>,
    rng: &mut R,
) -> LedgerResult<DrawResult> {
    let mut pool = tickets;

    let mut forced_ticket = match forced_winner {
        Some(user_id) => {
            let owned: Vec<usize> = pool
                .iter()
                .enumerate()
                .filter(|(_, t)| t.user_id == user_id)
                .map(|(i, _)| i)
                .collect();
            let Some(&index) = owned.choose(rng) else {
                return Err(LedgerError::invalid(format!(
                    "user {} holds no ticket in slot {}",
                    user_id, slot.id
                )));
            };
            Some(pool.swap_remove(index))
        }
        None => None,
    };

    pool.shuffle(rng);

    let mut prizes: Vec<&PrizeTier> = slot.prizes.iter().collect();
    prizes.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut result = DrawResult::default();
    let mut credited = Amount::ZERO;

    'tiers: for tier in prizes {
        for _ in 0..tier.winners_count {
            let Some(ticket) = forced_ticket.take().or_else(|| pool.pop()) else {
                break 'tiers;
            };

            let funded_by = match rule {
                FundingRule::TotalSales => slot.current_sales,
                FundingRule::RemainingSales => slot
                    .current_sales
                    .checked_sub(credited)
                    .unwrap_or(Amount::ZERO),
            };

            if tier.amount <= funded_by {
                credited = credited.saturating_add(tier.amount);
                result.winners.push(Winner {
                    user_id: ticket.user_id,
                    ticket_no: ticket.ticket_no,
                    prize_name: tier.name.clone(),
                    amount: tier.amount,
                });
            } else {
                result.skipped.push(SkippedPrize {
                    user_id: ticket.user_id,
                    ticket_no: ticket.ticket_no,
                    prize_name: tier.name.clone(),
                    amount: tier.amount,
                    funded_by,
                });
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lottery::types::{SlotOrigin, SlotStatus};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn slot_with(tickets: u64, price: i64, prizes: Vec<(i64, u32)>) -> (LotterySlot, Vec<Ticket>) {
        let slot = LotterySlot {
            id: "slot-1".to_string(),
            tier: "quick".to_string(),
            status: SlotStatus::Drawing,
            origin: SlotOrigin::Admin,
            prizes: prizes
                .into_iter()
                .enumerate()
                .map(|(i, (amount, winners_count))| PrizeTier {
                    name: format!("tier{}", i),
                    amount: Amount::units(amount),
                    winners_count,
                })
                .collect(),
            ticket_price: Amount::units(price),
            current_sales: Amount::units(price * tickets as i64),
            target_sales: Amount::units(1000),
            ticket_count: tickets,
            winners: vec![],
            skipped_prizes: vec![],
            start_time: 0,
            end_time: 1,
            draw_started_at: Some(1),
            completed_at: None,
        };
        let tickets = (1..=tickets)
            .map(|n| Ticket {
                ticket_no: n,
                user_id: format!("user{}", n % 3),
                purchased_at: 0,
            })
            .collect();
        (slot, tickets)
    }

    #[test]
    fn test_unfunded_tier_is_skipped() {
        // Sales 100: the 500 prize cannot be funded, the 20s can.
        let (slot, tickets) = slot_with(5, 20, vec![(20, 2), (500, 1)]);
        let mut rng = StdRng::seed_from_u64(1);
        let result = draw_winners(&slot, tickets, FundingRule::TotalSales, None, &mut rng).unwrap();

        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].amount, Amount::units(500));
        assert_eq!(result.winners.len(), 2);
        assert!(result.winners.iter().all(|w| w.amount <= slot.current_sales));
    }

    #[test]
    fn test_remaining_sales_rule_is_stricter() {
        // Sales 100: total-sales pays both 60s, remaining-sales only one.
        let (slot, tickets) = slot_with(5, 20, vec![(60, 2)]);
        let mut rng = StdRng::seed_from_u64(2);
        let total = draw_winners(&slot, tickets.clone(), FundingRule::TotalSales, None, &mut rng).unwrap();
        assert_eq!(total.winners.len(), 2);

        let mut rng = StdRng::seed_from_u64(2);
        let remaining = draw_winners(&slot, tickets, FundingRule::RemainingSales, None, &mut rng).unwrap();
        assert_eq!(remaining.winners.len(), 1);
        assert_eq!(remaining.skipped.len(), 1);
    }

    #[test]
    fn test_winners_are_distinct_tickets_and_bounded_by_pool() {
        let (slot, tickets) = slot_with(3, 100, vec![(50, 5)]);
        let mut rng = StdRng::seed_from_u64(3);
        let result = draw_winners(&slot, tickets, FundingRule::TotalSales, None, &mut rng).unwrap();

        assert_eq!(result.winners.len(), 3);
        let mut numbers: Vec<u64> = result.winners.iter().map(|w| w.ticket_no).collect();
        numbers.sort();
        numbers.dedup();
        assert_eq!(numbers.len(), 3);
    }

    #[test]
    fn test_forced_winner_takes_top_prize() {
        let (slot, tickets) = slot_with(30, 20, vec![(100, 1), (20, 3)]);
        let mut rng = StdRng::seed_from_u64(4);
        let result = draw_winners(&slot, tickets.clone(), FundingRule::TotalSales, Some("user2"), &mut rng).unwrap();

        assert_eq!(result.winners[0].user_id, "user2");
        assert_eq!(result.winners[0].amount, Amount::units(100));

        let mut rng = StdRng::seed_from_u64(4);
        assert!(draw_winners(&slot, tickets, FundingRule::TotalSales, Some("nobody"), &mut rng).is_err());
    }

    #[test]
    fn test_seeded_draws_are_reproducible() {
        let (slot, tickets) = slot_with(40, 20, vec![(100, 1), (20, 5)]);
        let a = draw_winners(&slot, tickets.clone(), FundingRule::TotalSales, None, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = draw_winners(&slot, tickets, FundingRule::TotalSales, None, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }
}

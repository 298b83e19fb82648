//! Lottery slots end to end: sales triggers, concurrent purchases, prize
//! funding, manual draws and the scheduler reveal.

use casino_ledger::config::LotteryConfig;
use casino_ledger::games::FixedOutcomeSource;
use casino_ledger::lottery::{PrizeTier, SlotStatus};
use casino_ledger::{Amount, BalanceKind, ConfigBuilder, Platform, PlatformEvent, SlotConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn open(dir: &std::path::Path, lottery: LotteryConfig) -> Platform {
    let config = ConfigBuilder::new().data_directory(dir).lottery(lottery).build();
    Platform::open_with(config, Arc::new(FixedOutcomeSource::always_lose()), StdRng::seed_from_u64(3)).unwrap()
}

fn manual_only() -> LotteryConfig {
    LotteryConfig {
        templates: vec![],
        ..LotteryConfig::default()
    }
}

fn slot_config(price: i64, target: i64, prizes: Vec<(&str, i64, u32)>) -> SlotConfig {
    SlotConfig {
        tier: "quick".to_string(),
        ticket_price: Amount::units(price),
        target_sales: Amount::units(target),
        prizes: prizes
            .into_iter()
            .map(|(name, amount, winners_count)| PrizeTier {
                name: name.to_string(),
                amount: Amount::units(amount),
                winners_count,
            })
            .collect(),
        duration_secs: 15 * 60,
        starts_at: None,
    }
}

fn funded(platform: &Platform, user: &str, main: i64) {
    platform.create_wallet(user).unwrap();
    platform.deposit(user, BalanceKind::Main, Amount::units(main)).unwrap();
}

#[test]
fn test_sales_target_moves_slot_to_drawing() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path(), manual_only());
    let slot = platform
        .create_lottery_slot(slot_config(20, 1000, vec![("grand", 500, 1), ("small", 20, 5)]))
        .unwrap();

    for i in 0..5 {
        let user = format!("player{}", i);
        funded(&platform, &user, 200);
        let receipt = platform.buy_ticket(&user, 10, &slot.id).unwrap();
        assert_eq!(receipt.target_newly_reached, i == 4);
    }

    let slot = platform.slot(&slot.id).unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Drawing);
    assert_eq!(slot.tickets_sold(), 50);
    assert_eq!(slot.current_sales, Amount::units(1000));
    assert!(slot.end_time > casino_ledger::now_millis());

    let err = platform.buy_ticket("player0", 1, &slot.id).unwrap_err();
    assert_eq!(err.kind(), casino_ledger::ErrorKind::SlotClosedOrInvalid);
}

#[test]
fn test_concurrent_purchases_sum_exactly() {
    const K: usize = 12;
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path(), manual_only());
    let slot = platform
        .create_lottery_slot(slot_config(20, 100_000, vec![("grand", 100, 1)]))
        .unwrap();
    for i in 0..K {
        funded(&platform, &format!("buyer{}", i), 100);
    }

    let barrier = Arc::new(Barrier::new(K));
    let handles: Vec<_> = (0..K)
        .map(|i| {
            let platform = platform.clone();
            let barrier = barrier.clone();
            let slot_id = slot.id.clone();
            thread::spawn(move || {
                barrier.wait();
                platform.buy_ticket(&format!("buyer{}", i), 1, &slot_id)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let slot = platform.slot(&slot.id).unwrap().unwrap();
    assert_eq!(slot.current_sales, Amount::units(20 * K as i64));
    assert_eq!(slot.tickets_sold(), K);
    let tickets = platform.slot_tickets(&slot.id).unwrap();
    let numbers: Vec<u64> = tickets.iter().map(|t| t.ticket_no).collect();
    assert_eq!(numbers, (1..=K as u64).collect::<Vec<_>>());
    let mut holders: Vec<&str> = tickets.iter().map(|t| t.user_id.as_str()).collect();
    holders.sort();
    holders.dedup();
    assert_eq!(holders.len(), K);
    for i in 0..K {
        assert_eq!(platform.wallet(&format!("buyer{}", i)).unwrap().main, Amount::units(80));
    }
}

#[test]
fn test_unfunded_prize_is_never_credited() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path(), manual_only());
    let slot = platform
        .create_lottery_slot(slot_config(20, 1000, vec![("grand", 500, 1), ("small", 20, 2)]))
        .unwrap();
    funded(&platform, "solo", 100);
    platform.buy_ticket("solo", 5, &slot.id).unwrap();

    platform.force_draw(&slot.id).unwrap();
    let done = platform
        .lottery()
        .finalize(&slot.id, casino_ledger::now_millis())
        .unwrap();

    assert_eq!(done.status, SlotStatus::Completed);
    assert!(done.winners.iter().all(|w| w.amount <= done.current_sales));
    assert_eq!(done.skipped_prizes.len(), 1);
    assert_eq!(done.skipped_prizes[0].prize_name, "grand");
    assert_eq!(done.winners.len(), 2);
    // 100 - 100 tickets + 2 x 20
    assert_eq!(platform.wallet("solo").unwrap().main, Amount::units(40));
    assert!(platform.reconcile("solo").unwrap().is_consistent());
}

#[test]
fn test_completed_slot_is_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path(), manual_only());
    let slot = platform
        .create_lottery_slot(slot_config(10, 1000, vec![("grand", 10, 1)]))
        .unwrap();
    funded(&platform, "amy", 50);
    funded(&platform, "ben", 50);
    platform.buy_ticket("amy", 1, &slot.id).unwrap();
    platform.buy_ticket("ben", 1, &slot.id).unwrap();

    let done = platform.manual_draw(&slot.id, "ben").unwrap();
    assert_eq!(done.winners[0].user_id, "ben");

    assert!(platform.force_draw(&slot.id).is_err());
    assert!(platform.buy_ticket("amy", 1, &slot.id).is_err());
    assert!(platform.manual_draw(&slot.id, "amy").is_err());
    assert_eq!(platform.slot(&slot.id).unwrap().unwrap().winners, done.winners);
}

#[test]
fn test_manual_draw_from_active_passes_through_drawing() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path(), manual_only());
    let slot = platform
        .create_lottery_slot(slot_config(20, 1000, vec![("grand", 60, 1)]))
        .unwrap();
    funded(&platform, "cleo", 100);
    funded(&platform, "dan", 100);
    platform.buy_ticket("cleo", 2, &slot.id).unwrap();
    platform.buy_ticket("dan", 2, &slot.id).unwrap();
    assert_eq!(platform.slot(&slot.id).unwrap().unwrap().status, SlotStatus::Active);

    let mut events = platform.subscribe();
    let done = platform.manual_draw(&slot.id, "dan").unwrap();
    assert_eq!(done.status, SlotStatus::Completed);
    assert!(done.draw_started_at.is_some());
    assert_eq!(done.winners.len(), 1);
    assert_eq!(done.winners[0].user_id, "dan");

    let mut names = Vec::new();
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
        if let PlatformEvent::LotteryUpdate { status, .. } = &event {
            statuses.push(*status);
        }
    }
    let start = names.iter().position(|n| *n == "lottery_draw_start").unwrap();
    let win = names.iter().position(|n| *n == "lottery_win").unwrap();
    assert!(start < win);
    assert_eq!(statuses.first(), Some(&SlotStatus::Drawing));
    assert_eq!(statuses.last(), Some(&SlotStatus::Completed));
    // 100 - 40 tickets + 60 prize
    assert_eq!(platform.wallet("dan").unwrap().main, Amount::units(120));
}

#[test]
fn test_purchase_before_slot_opens_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path(), manual_only());
    let mut config = slot_config(20, 1000, vec![("grand", 100, 1)]);
    config.starts_at = Some(casino_ledger::now_millis() + 60_000);
    let slot = platform.create_lottery_slot(config).unwrap();
    funded(&platform, "early", 100);

    let err = platform.buy_ticket("early", 1, &slot.id).unwrap_err();
    assert_eq!(err.kind(), casino_ledger::ErrorKind::SlotClosedOrInvalid);
    assert_eq!(platform.wallet("early").unwrap().main, Amount::units(100));
    assert!(platform.slot_tickets(&slot.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduler_reveals_after_sales_target() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(
        dir.path(),
        LotteryConfig {
            reveal_delay_secs: 1,
            tick_interval_secs: 3600,
            templates: vec![],
            ..LotteryConfig::default()
        },
    );
    let mut events = platform.subscribe();
    let scheduler = platform.start_scheduler();

    let slot = platform
        .create_lottery_slot(slot_config(20, 1000, vec![("grand", 500, 1)]))
        .unwrap();
    funded(&platform, "whale", 1000);
    platform.buy_ticket("whale", 50, &slot.id).unwrap();
    assert_eq!(platform.slot(&slot.id).unwrap().unwrap().status, SlotStatus::Drawing);

    let mut status = SlotStatus::Drawing;
    for _ in 0..100 {
        status = platform.slot(&slot.id).unwrap().unwrap().status;
        if status == SlotStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status, SlotStatus::Completed);
    assert_eq!(platform.wallet("whale").unwrap().main, Amount::units(500));

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
        if let PlatformEvent::LotteryWin { user_id, amount, .. } = &event {
            assert_eq!(user_id, "whale");
            assert_eq!(*amount, Amount::units(500));
        }
    }
    assert!(names.contains(&"lottery_draw_start"));
    assert!(names.contains(&"lottery_win"));

    scheduler.shutdown().await;
}

#[test]
fn test_tick_creates_template_slots_once() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path(), LotteryConfig::default());

    let first = platform.run_lottery_tick().unwrap();
    assert_eq!(first.created.len(), LotteryConfig::default().templates.len());
    let second = platform.run_lottery_tick().unwrap();
    assert!(second.created.is_empty());
    assert_eq!(platform.active_slots(Some("quick")).unwrap().len(), 1);
}

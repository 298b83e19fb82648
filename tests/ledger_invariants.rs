//! Wallet ledger invariants: non-negative balances, journal reconciliation,
//! concurrent mutations and state surviving a restart.

use casino_ledger::games::FixedOutcomeSource;
use casino_ledger::{Amount, AppConfig, BalanceKind, ConfigBuilder, LedgerError, Platform, PlatformEvent, TxType};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread;

fn config(dir: &std::path::Path) -> AppConfig {
    ConfigBuilder::new().data_directory(dir).build()
}

fn open(dir: &std::path::Path) -> Platform {
    Platform::open_with(config(dir), Arc::new(FixedOutcomeSource::always_lose()), StdRng::seed_from_u64(1)).unwrap()
}

#[test]
fn test_balances_never_go_negative() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path());
    platform.create_wallet("alice").unwrap();
    platform.deposit("alice", BalanceKind::Main, Amount::units(30)).unwrap();

    let err = platform
        .withdraw("alice", BalanceKind::Main, Amount::units(31))
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    let err = platform
        .transfer("alice", BalanceKind::Game, BalanceKind::Main, Amount::units(1))
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    let wallet = platform.wallet("alice").unwrap();
    for (_, amount) in wallet.balances() {
        assert!(!amount.is_negative());
    }
    assert_eq!(wallet.main, Amount::units(30));
    assert_eq!(platform.history("alice", 10).unwrap().len(), 1);
}

#[test]
fn test_journal_replays_to_wallet() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path());
    platform.create_wallet("bob").unwrap();

    platform.deposit("bob", BalanceKind::Main, Amount::units(500)).unwrap();
    platform
        .transfer("bob", BalanceKind::Main, BalanceKind::Game, Amount::units(200))
        .unwrap();
    platform
        .settle_bet("bob", Amount::units(50), casino_ledger::GameKind::Slots, "r1")
        .unwrap();
    platform.deposit("bob", BalanceKind::Commission, Amount::units(7)).unwrap();
    platform.withdraw("bob", BalanceKind::Main, Amount::units(100)).unwrap();

    let report = platform.reconcile("bob").unwrap();
    assert!(report.is_consistent(), "{:?}", report.mismatches);
    assert_eq!(report.entries, 5);
    assert_eq!(report.replayed.get(&BalanceKind::Game).copied(), Some(Amount::units(150)));

    let history = platform.history("bob", 10).unwrap();
    let types: Vec<TxType> = history.iter().map(|e| e.tx_type).collect();
    assert_eq!(
        types,
        vec![
            TxType::Deposit,
            TxType::Transfer,
            TxType::GameSettlement,
            TxType::Deposit,
            TxType::Withdrawal
        ]
    );
    let versions: Vec<u64> = history.iter().map(|e| e.wallet_version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_concurrent_withdrawals_all_apply() {
    const N: usize = 16;
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path());
    platform.create_wallet("carol").unwrap();
    platform
        .deposit("carol", BalanceKind::Main, Amount::units(3 * N as i64))
        .unwrap();

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let platform = platform.clone();
            thread::spawn(move || platform.withdraw("carol", BalanceKind::Main, Amount::units(3)))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let wallet = platform.wallet("carol").unwrap();
    assert_eq!(wallet.main, Amount::ZERO);
    assert_eq!(wallet.version, N as u64 + 1);
    assert!(platform.reconcile("carol").unwrap().is_consistent());
}

#[test]
fn test_wallet_events_follow_commits() {
    let dir = tempfile::tempdir().unwrap();
    let platform = open(dir.path());
    let mut events = platform.subscribe();
    platform.create_wallet("dan").unwrap();

    platform.deposit("dan", BalanceKind::Main, Amount::units(12)).unwrap();
    let _ = platform.withdraw("dan", BalanceKind::Main, Amount::units(99));

    match events.try_recv().unwrap() {
        PlatformEvent::WalletUpdate {
            user_id,
            balance,
            amount,
            balance_after,
            ..
        } => {
            assert_eq!(user_id, "dan");
            assert_eq!(balance, BalanceKind::Main);
            assert_eq!(amount, Amount::units(12));
            assert_eq!(balance_after, Amount::units(12));
        }
        other => panic!("unexpected event {:?}", other),
    }
    // The failed withdrawal published nothing.
    assert!(events.try_recv().is_err());
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let public_key = {
        let platform = Platform::open(config(dir.path())).unwrap();
        platform.create_wallet("erin").unwrap();
        platform.deposit("erin", BalanceKind::Game, Amount::units(40)).unwrap();
        platform
            .settle_bet("erin", Amount::units(10), casino_ledger::GameKind::Dice, "persist-1")
            .unwrap()
            .round
            .proof
            .map(|p| p.public_key)
    };

    let platform = Platform::open(config(dir.path())).unwrap();
    let wallet = platform.wallet("erin").unwrap();
    assert_eq!(wallet.version, 2);
    assert!(platform.reconcile("erin").unwrap().is_consistent());
    assert!(platform.round("persist-1").unwrap().is_some());

    let err = platform
        .settle_bet("erin", Amount::units(10), casino_ledger::GameKind::Dice, "persist-1")
        .unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateRound(_)));

    // Same VRF key after reopening.
    let again = platform
        .settle_bet("erin", Amount::units(1), casino_ledger::GameKind::Dice, "persist-2")
        .unwrap();
    assert_eq!(again.round.proof.map(|p| p.public_key), public_key);
    assert!(public_key.is_some());
}

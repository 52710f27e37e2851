//! Racing writers against one wallet over contended in-memory state.

use crate::mocks::{activate, create_config, create_engine_with, fund, ALL_LOSE, COIN_FLIP};
use crate::{EngineConfig, LedgerConfig, Memory};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spinwallet_types::{api::SpinRequest, UserId, WalletError, SOURCE_SPIN_WAGER};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spins_never_overdraw() {
    let (engine, state) = create_engine_with(Memory::contended(), create_config());
    activate(&engine, ALL_LOSE).await;
    let user = UserId(1);
    fund(&engine, user, dec!(100)).await;

    let request = SpinRequest {
        unit_cost: dec!(20),
        count: 1,
    };
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = engine.clone();
            let request = request.clone();
            tokio::spawn(async move { engine.spins.spin(user, &request).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut refused = 0;
    for result in join_all(handles).await {
        match result.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => {
                assert!(
                    matches!(
                        err.as_wallet(),
                        Some(WalletError::InsufficientFunds { .. })
                    ),
                    "unexpected error: {err}"
                );
                refused += 1;
            }
        }
    }
    assert_eq!(succeeded, 5);
    assert_eq!(refused, 5);

    let snapshot = engine.ledger.balance(user).await.unwrap();
    assert_eq!(snapshot.balance, Decimal::ZERO);
    assert_eq!(snapshot.total_losses, dec!(100));
    // One funding deposit and one debit per successful spin.
    assert_eq!(state.transaction_count(), 6);
    assert!(engine.ledger.audit(user).await.unwrap().is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deposits_all_land() {
    let (engine, _) = create_engine_with(Memory::contended(), create_config());
    let user = UserId(2);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .ledger
                    .deposit(user, dec!(10), &format!("dep-{i}"), "burst")
                    .await
            })
        })
        .collect();
    for result in join_all(handles).await {
        let (_, created) = result.unwrap().unwrap();
        assert!(created);
    }

    let report = engine.ledger.audit(user).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.entries, 20);
    assert_eq!(report.stored.balance, dec!(200));
    assert_eq!(report.stored.total_deposits, dec!(200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wallets_do_not_interfere() {
    let (engine, _) = create_engine_with(Memory::contended(), create_config());
    activate(&engine, COIN_FLIP).await;
    let users: Vec<_> = (10..16).map(UserId).collect();
    for user in &users {
        fund(&engine, *user, dec!(50)).await;
    }

    let handles: Vec<_> = users
        .iter()
        .map(|user| {
            let engine = engine.clone();
            let user = *user;
            tokio::spawn(async move {
                let request = SpinRequest {
                    unit_cost: dec!(5),
                    count: 4,
                };
                engine.spins.spin(user, &request).await
            })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    for (user, result) in users.iter().zip(results) {
        let snapshot = engine.ledger.balance(*user).await.unwrap();
        assert_eq!(snapshot.balance, result.balance_after);
        assert_eq!(
            snapshot.balance,
            dec!(50) - dec!(20) + result.summary.total_payout
        );
        assert!(engine.ledger.audit(*user).await.unwrap().is_consistent());
    }
}

#[tokio::test]
async fn test_stale_commits_are_retried() {
    let (engine, state) = create_engine_with(Memory::default(), create_config());
    let user = UserId(3);
    fund(&engine, user, dec!(100)).await;

    state.inject_stale_wallets(3);
    let debit = engine
        .ledger
        .debit(user, dec!(40), SOURCE_SPIN_WAGER, "retried")
        .await
        .unwrap();
    assert_eq!(debit.amount, dec!(40));
    assert_eq!(engine.ledger.balance(user).await.unwrap().balance, dec!(60));
}

#[tokio::test]
async fn test_retry_exhaustion_is_a_concurrency_conflict() {
    let config = EngineConfig {
        ledger: LedgerConfig {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        },
        ..create_config()
    };
    let (engine, state) = create_engine_with(Memory::default(), config);
    let user = UserId(4);
    fund(&engine, user, dec!(100)).await;

    state.inject_stale_wallets(5);
    let err = engine
        .ledger
        .debit(user, dec!(10), SOURCE_SPIN_WAGER, "exhausted")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_wallet(),
        Some(&WalletError::ConcurrencyConflict { user, attempts: 2 })
    );
    assert!(err.is_transient());
    assert_eq!(engine.ledger.balance(user).await.unwrap().balance, dec!(100));
}

//! Payment reconciliation: duplicate, conflicting and late confirmations.

use crate::mocks::{create_config, create_engine_with, MockProvider, ProviderMode};
use crate::{Engine, EngineConfig, Memory, PaymentConfig, Reconciliation, State, TransactionFilter};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use spinwallet_types::{
    api::{PaymentConfirmation, PaymentStatusQuery},
    PaymentOutcome, PaymentRequest, PaymentStatus, TransactionKind, UserId, WalletError,
    SOURCE_DEPOSIT,
};
use std::sync::Arc;
use std::time::Duration;

const PHONE: &str = "0712345678";

fn engine() -> (Engine<Memory>, Arc<Memory>) {
    create_engine_with(Memory::default(), create_config())
}

async fn pending(engine: &Engine<Memory>, user: UserId, reference: &str) -> PaymentRequest {
    let provider = MockProvider::new(ProviderMode::Fixed(reference.to_string()));
    engine
        .payments
        .initiate(&provider, user, dec!(500), PHONE)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_initiate_moves_to_pending_with_reference() {
    let (engine, _) = engine();
    let provider = MockProvider::acknowledging();
    let request = engine
        .payments
        .initiate(&provider, UserId(1), dec!(250), "+254 712 345 678")
        .await
        .unwrap();
    assert_eq!(request.status, PaymentStatus::Pending);
    assert_eq!(request.checkout_reference.as_deref(), Some("ws_CO_1"));
    assert_eq!(request.phone, "254712345678");
    assert_eq!(provider.issued(), 1);

    let response = engine
        .payments
        .query(&PaymentStatusQuery {
            checkout_reference: "ws_CO_1".into(),
        })
        .await
        .unwrap();
    assert_eq!(response.status, PaymentStatus::Pending);
    assert_eq!(response.amount, dec!(250));
    assert!(response.completed_at.is_none());
}

#[tokio::test]
async fn test_initiate_validates_before_recording() {
    let (engine, state) = engine();
    let provider = MockProvider::acknowledging();
    let err = engine
        .payments
        .initiate(&provider, UserId(1), dec!(250), "12345")
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_wallet(),
        Some(WalletError::InvalidPhone { .. })
    ));
    let err = engine
        .payments
        .initiate(&provider, UserId(1), dec!(0), PHONE)
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_wallet(),
        Some(WalletError::InvalidAmount { .. })
    ));
    assert_eq!(provider.issued(), 0);
    let all = [PaymentStatus::Initiated, PaymentStatus::Failed];
    let later = Utc::now() + ChronoDuration::seconds(1);
    assert!(state.payments_in(&all, later).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_success_credits_once() {
    let (engine, state) = engine();
    let user = UserId(1);
    pending(&engine, user, "R1").await;

    let confirmation = PaymentConfirmation::success("R1", dec!(500));
    let first = engine.payments.reconcile(&confirmation).await.unwrap();
    assert!(first.is_first_delivery());
    assert_eq!(first.payment().status, PaymentStatus::Success);
    assert!(first.payment().completed_at.is_some());
    match &first {
        Reconciliation::Applied {
            deposit: Some(deposit),
            ..
        } => {
            assert_eq!(deposit.amount, dec!(500));
            assert_eq!(deposit.source, SOURCE_DEPOSIT);
            assert_eq!(deposit.external_reference.as_deref(), Some("R1"));
        }
        other => panic!("unexpected reconciliation: {other:?}"),
    }

    let second = engine.payments.reconcile(&confirmation).await.unwrap();
    assert!(!second.is_first_delivery());
    assert_eq!(second.payment().status, PaymentStatus::Success);

    let snapshot = engine.ledger.balance(user).await.unwrap();
    assert_eq!(snapshot.balance, dec!(500));
    assert_eq!(snapshot.total_deposits, dec!(500));
    let deposits = engine
        .ledger
        .history(user, TransactionFilter::default().kind(TransactionKind::Deposit))
        .await
        .unwrap();
    assert_eq!(deposits.len(), 1);
    assert_eq!(state.transaction_count(), 1);
}

#[tokio::test]
async fn test_conflicting_confirmation_is_rejected() {
    let (engine, _) = engine();
    let user = UserId(2);
    pending(&engine, user, "R2").await;
    engine
        .payments
        .reconcile(&PaymentConfirmation::success("R2", dec!(500)))
        .await
        .unwrap();

    let err = engine
        .payments
        .reconcile(&PaymentConfirmation::failed("R2", "cancelled by user"))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_wallet(),
        Some(&WalletError::ConflictingReconciliation {
            reference: "R2".into(),
            existing: PaymentStatus::Success,
            attempted: PaymentOutcome::Failed,
        })
    );
    let record = engine.payments.status_of("R2").await.unwrap();
    assert_eq!(record.status, PaymentStatus::Success);
    assert!(record.error_message.is_none());
    assert_eq!(engine.ledger.balance(user).await.unwrap().balance, dec!(500));
}

#[tokio::test]
async fn test_failure_then_success_never_credits() {
    let (engine, state) = engine();
    let user = UserId(3);
    pending(&engine, user, "R3").await;

    let failed = engine
        .payments
        .reconcile(&PaymentConfirmation::failed("R3", "insufficient balance"))
        .await
        .unwrap();
    assert!(failed.is_first_delivery());
    assert_eq!(
        failed.payment().error_message.as_deref(),
        Some("insufficient balance")
    );

    // Repeating the failure is a no-op.
    let repeat = engine
        .payments
        .reconcile(&PaymentConfirmation::failed("R3", "insufficient balance"))
        .await
        .unwrap();
    assert!(!repeat.is_first_delivery());

    let err = engine
        .payments
        .reconcile(&PaymentConfirmation::success("R3", dec!(500)))
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_wallet(),
        Some(WalletError::ConflictingReconciliation { .. })
    ));
    assert_eq!(state.transaction_count(), 0);
}

#[tokio::test]
async fn test_amount_mismatch_leaves_request_pending() {
    let (engine, _) = engine();
    let user = UserId(4);
    pending(&engine, user, "R4").await;

    let err = engine
        .payments
        .reconcile(&PaymentConfirmation::success("R4", dec!(5000)))
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_wallet(),
        Some(WalletError::AmountMismatch { .. })
    ));
    assert_eq!(
        engine.payments.status_of("R4").await.unwrap().status,
        PaymentStatus::Pending
    );

    // A confirmation without an amount is trusted to match the request.
    let confirmation = PaymentConfirmation {
        checkout_reference: "R4".into(),
        outcome: PaymentOutcome::Success,
        amount: None,
        error_message: None,
    };
    engine.payments.reconcile(&confirmation).await.unwrap();
    assert_eq!(engine.ledger.balance(user).await.unwrap().balance, dec!(500));
}

#[tokio::test]
async fn test_unknown_reference() {
    let (engine, _) = engine();
    let err = engine
        .payments
        .reconcile(&PaymentConfirmation::success("missing", dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_wallet(),
        Some(WalletError::PaymentNotFound { .. })
    ));

    let ack = engine
        .payments
        .handle_confirmation(&PaymentConfirmation::success("missing", dec!(1)))
        .await;
    assert!(!ack.accepted);
    assert!(!ack.first_delivery);
}

#[tokio::test]
async fn test_handle_confirmation_acknowledges_every_delivery() {
    let (engine, _) = engine();
    pending(&engine, UserId(5), "R5").await;
    let confirmation = PaymentConfirmation::success("R5", dec!(500));

    let first = engine.payments.handle_confirmation(&confirmation).await;
    assert!(first.accepted);
    assert!(first.first_delivery);
    assert_eq!(first.message, "payment success");

    let second = engine.payments.handle_confirmation(&confirmation).await;
    assert!(second.accepted);
    assert!(!second.first_delivery);

    let conflict = engine
        .payments
        .handle_confirmation(&PaymentConfirmation::failed("R5", "late"))
        .await;
    assert!(!conflict.accepted);
    assert_eq!(conflict.checkout_reference, "R5");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_deliveries_credit_once() {
    let (engine, state) = create_engine_with(Memory::contended(), create_config());
    let user = UserId(6);
    pending(&engine, user, "R6").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .payments
                .reconcile(&PaymentConfirmation::success("R6", dec!(500)))
                .await
        }));
    }
    let mut first = 0;
    for result in futures::future::join_all(handles).await {
        if result.unwrap().unwrap().is_first_delivery() {
            first += 1;
        }
    }
    assert_eq!(first, 1);
    assert_eq!(engine.ledger.balance(user).await.unwrap().balance, dec!(500));
    assert_eq!(state.transaction_count(), 1);
}

#[tokio::test]
async fn test_initiation_timeout_fails_request() {
    let config = EngineConfig {
        payments: PaymentConfig {
            initiation_timeout: Duration::from_millis(20),
            ..Default::default()
        },
        ..create_config()
    };
    let (engine, state) = create_engine_with(Memory::default(), config);
    let provider = MockProvider::new(ProviderMode::Delay(Duration::from_secs(5)));

    let err = engine
        .payments
        .initiate(&provider, UserId(7), dec!(100), PHONE)
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_wallet(),
        Some(WalletError::PaymentTimedOut { .. })
    ));
    assert!(err.is_transient());

    let later = Utc::now() + ChronoDuration::seconds(1);
    let failed = state
        .payments_in(&[PaymentStatus::Failed], later)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].completed_at.is_some());
    let initiated = state
        .payments_in(&[PaymentStatus::Initiated], later)
        .await
        .unwrap();
    assert!(initiated.is_empty());
}

#[tokio::test]
async fn test_provider_rejection_fails_request() {
    let (engine, state) = engine();
    let provider = MockProvider::new(ProviderMode::Reject("invalid account".into()));
    let err = engine
        .payments
        .initiate(&provider, UserId(8), dec!(100), PHONE)
        .await
        .unwrap_err();
    assert!(matches!(err.as_wallet(), Some(WalletError::Provider { .. })));

    let later = Utc::now() + ChronoDuration::seconds(1);
    let failed = state
        .payments_in(&[PaymentStatus::Failed], later)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].error_message.as_deref(),
        Some("rejected: invalid account")
    );
}

#[tokio::test]
async fn test_reused_checkout_reference_fails_second_request() {
    let (engine, _) = engine();
    pending(&engine, UserId(9), "DUP").await;
    let provider = MockProvider::new(ProviderMode::Fixed("DUP".into()));
    let err = engine
        .payments
        .initiate(&provider, UserId(10), dec!(100), PHONE)
        .await
        .unwrap_err();
    assert!(matches!(err.as_wallet(), Some(WalletError::Provider { .. })));
    // The original request still owns the reference.
    assert_eq!(
        engine.payments.status_of("DUP").await.unwrap().user,
        UserId(9)
    );
}

#[tokio::test]
async fn test_sweep_expires_stale_requests_only() {
    let (engine, state) = engine();
    let user = UserId(11);
    pending(&engine, user, "R11").await;

    // Stuck before the provider ever answered.
    let mut stuck = PaymentRequest::new(user, dec!(50), "254712345678".into(), Utc::now());
    stuck.initiated_at = Utc::now() - ChronoDuration::seconds(600);
    state
        .apply(vec![crate::Change::Payment {
            payment: stuck.clone(),
            expected_status: None,
        }])
        .await
        .unwrap();

    let expired = engine.payments.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, stuck.id);
    assert_eq!(expired[0].status, PaymentStatus::Expired);
    assert_eq!(
        engine.payments.status_of("R11").await.unwrap().status,
        PaymentStatus::Pending
    );

    let later = Utc::now() + ChronoDuration::seconds(301);
    let expired = engine.payments.sweep_expired(later).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(
        engine.payments.status_of("R11").await.unwrap().status,
        PaymentStatus::Expired
    );

    // Expiry is terminal: a late failure is a duplicate, a late success a conflict.
    let late_failure = engine
        .payments
        .reconcile(&PaymentConfirmation::failed("R11", "timeout"))
        .await
        .unwrap();
    assert!(!late_failure.is_first_delivery());
    let err = engine
        .payments
        .reconcile(&PaymentConfirmation::success("R11", dec!(500)))
        .await
        .unwrap_err();
    assert_eq!(
        err.as_wallet(),
        Some(&WalletError::ConflictingReconciliation {
            reference: "R11".into(),
            existing: PaymentStatus::Expired,
            attempted: PaymentOutcome::Success,
        })
    );
    assert!(err.to_string().contains("existing=expired"), "{err}");
    assert_eq!(engine.ledger.balance(user).await.unwrap().balance, dec!(0));

    assert!(engine
        .payments
        .sweep_expired(later)
        .await
        .unwrap()
        .is_empty());
}

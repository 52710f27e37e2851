//! Common types used throughout spinwallet.
//!
//! Every money-bearing value in this crate is a [`rust_decimal::Decimal`]. Probabilities are the
//! only floating point values and never take part in monetary arithmetic.

pub mod api;
pub mod error;
pub mod money;
pub mod payment;
pub mod spin;
pub mod wallet;

pub use error::WalletError;
pub use money::{Amount, CURRENCY, MAX_AMOUNT, MONEY_SCALE};
pub use payment::{PaymentOutcome, PaymentRequest, PaymentStatus};
pub use spin::{
    ActivationWindow, AlgorithmConfiguration, OutcomeSegment, SpinBatchResult, SpinDraw,
    SpinSummary,
};
pub use wallet::{
    BalanceSnapshot, Totals, Transaction, TransactionKind, UserId, Wallet, WalletId,
    SOURCE_DEPOSIT, SOURCE_REFUND, SOURCE_SPIN_PAYOUT, SOURCE_SPIN_WAGER, SOURCE_WITHDRAWAL,
};

use rust_decimal::Decimal;
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::payment::{PaymentOutcome, PaymentStatus};
use crate::wallet::UserId;

/// Domain errors surfaced to callers of the wallet core.
///
/// Every variant is returned before any state is mutated, so a caller receiving one of these
/// can assume the ledger is exactly as it was before the call.
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum WalletError {
    #[error("insufficient funds (required={required}, available={available})")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },
    #[error("invalid spin count (count={count}, max={max})")]
    InvalidCount { count: u32, max: u32 },
    #[error("invalid amount: {amount}")]
    InvalidAmount { amount: Decimal },
    #[error("no active algorithm configuration")]
    Unconfigured,
    #[error("unknown algorithm: {key}")]
    UnknownAlgorithm { key: String },
    #[error("algorithm configuration not found: {name}")]
    ConfigurationNotFound { name: String },
    #[error("invalid distribution for {key}: {reason}")]
    InvalidDistribution { key: String, reason: String },
    #[error(
        "conflicting reconciliation for {reference} (existing={existing}, attempted={attempted:?})"
    )]
    ConflictingReconciliation {
        reference: String,
        /// Terminal status as stored, so an expired request is reported as `expired`.
        existing: PaymentStatus,
        attempted: PaymentOutcome,
    },
    #[error("concurrency conflict on wallet of user {user} after {attempts} attempts")]
    ConcurrencyConflict { user: UserId, attempts: u32 },
    #[error("payment not found: {reference}")]
    PaymentNotFound { reference: String },
    #[error("payment {id} timed out waiting for the provider")]
    PaymentTimedOut { id: Uuid },
    #[error("payment provider rejected request: {reason}")]
    Provider { reason: String },
    #[error("amount mismatch for {reference} (expected={expected}, reported={reported})")]
    AmountMismatch {
        reference: String,
        expected: Decimal,
        reported: Decimal,
    },
    #[error("invalid phone number: {phone}")]
    InvalidPhone { phone: String },
}

impl WalletError {
    /// Whether retrying the same request later could succeed without caller changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WalletError::ConcurrencyConflict { .. }
                | WalletError::PaymentTimedOut { .. }
                | WalletError::Provider { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InsufficientFunds { .. } => "insufficient_funds",
            WalletError::InvalidCount { .. } => "invalid_count",
            WalletError::InvalidAmount { .. } => "invalid_amount",
            WalletError::Unconfigured => "unconfigured",
            WalletError::UnknownAlgorithm { .. } => "unknown_algorithm",
            WalletError::ConfigurationNotFound { .. } => "configuration_not_found",
            WalletError::InvalidDistribution { .. } => "invalid_distribution",
            WalletError::ConflictingReconciliation { .. } => "conflicting_reconciliation",
            WalletError::ConcurrencyConflict { .. } => "concurrency_conflict",
            WalletError::PaymentNotFound { .. } => "payment_not_found",
            WalletError::PaymentTimedOut { .. } => "payment_timed_out",
            WalletError::Provider { .. } => "provider_error",
            WalletError::AmountMismatch { .. } => "amount_mismatch",
            WalletError::InvalidPhone { .. } => "invalid_phone",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insufficient_funds_message_carries_amounts() {
        let err = WalletError::InsufficientFunds {
            required: dec!(100),
            available: dec!(30),
        };
        assert_eq!(
            err.to_string(),
            "insufficient funds (required=100, available=30)"
        );
        assert_eq!(err.code(), "insufficient_funds");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_concurrency_conflict_is_transient() {
        let err = WalletError::ConcurrencyConflict {
            user: UserId(1),
            attempts: 8,
        };
        assert!(err.is_transient());
    }
}

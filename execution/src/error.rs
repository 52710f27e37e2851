use spinwallet_types::{TransactionKind, UserId, WalletError, WalletId};
use thiserror::Error as ThisError;
use uuid::Uuid;

/// Rejection raised by a [`crate::State`] while applying a batch of changes.
///
/// A batch that fails with any of these has not been applied in part.
#[derive(Debug, ThisError)]
pub enum CommitError {
    #[error("stale wallet for user {user} (expected_version={expected:?})")]
    StaleWallet { user: UserId, expected: Option<u64> },
    #[error("stale payment {id}")]
    StalePayment { id: Uuid },
    #[error("duplicate {kind} for reference {reference} on wallet {wallet_id}")]
    Duplicate {
        wallet_id: WalletId,
        reference: String,
        kind: TransactionKind,
    },
    #[error("duplicate checkout reference {reference}")]
    DuplicateCheckout { reference: String },
    #[error("algorithm configuration not found: {name}")]
    MissingConfiguration { name: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Error returned by every execution-layer operation.
#[derive(Debug, ThisError)]
pub enum EngineError {
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// The domain error, if this is one.
    pub fn as_wallet(&self) -> Option<&WalletError> {
        match self {
            EngineError::Wallet(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the whole request may be retried as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Wallet(err) => err.is_transient(),
            EngineError::Commit(CommitError::StaleWallet { .. })
            | EngineError::Commit(CommitError::StalePayment { .. }) => true,
            _ => false,
        }
    }
}

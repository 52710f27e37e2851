use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::error::WalletError;
use crate::money::{checked_add, checked_sub};

/// Transaction source for the aggregate wager of a spin batch.
pub const SOURCE_SPIN_WAGER: &str = "spin_wager";
/// Transaction source for the aggregate payout of a spin batch.
pub const SOURCE_SPIN_PAYOUT: &str = "spin_payout";
/// Transaction source for reconciled mobile-money deposits.
pub const SOURCE_DEPOSIT: &str = "deposit";
pub const SOURCE_REFUND: &str = "refund";
pub const SOURCE_WITHDRAWAL: &str = "withdrawal";

/// Authenticated user identity handed to the core by the web layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type WalletId = Uuid;

/// Per-user balance with audit accumulators.
///
/// `version` increases by one on every committed mutation and is the compare-and-swap token
/// for optimistic concurrency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user: UserId,
    pub balance: Decimal,
    pub total_deposits: Decimal,
    pub total_winnings: Decimal,
    pub total_losses: Decimal,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            balance: Decimal::ZERO,
            total_deposits: Decimal::ZERO,
            total_winnings: Decimal::ZERO,
            total_losses: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn totals(&self) -> Totals {
        Totals {
            balance: self.balance,
            total_deposits: self.total_deposits,
            total_winnings: self.total_winnings,
            total_losses: self.total_losses,
        }
    }

    pub fn set_totals(&mut self, totals: Totals) {
        self.balance = totals.balance;
        self.total_deposits = totals.total_deposits;
        self.total_winnings = totals.total_winnings;
        self.total_losses = totals.total_losses;
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            balance: self.balance,
            total_deposits: self.total_deposits,
            total_winnings: self.total_winnings,
            total_losses: self.total_losses,
            updated_at: self.updated_at,
        }
    }
}

/// Lightweight balance view returned to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub balance: Decimal,
    pub total_deposits: Decimal,
    pub total_winnings: Decimal,
    pub total_losses: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Debit,
    Credit,
    Refund,
    Withdrawal,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 5] = [
        TransactionKind::Deposit,
        TransactionKind::Debit,
        TransactionKind::Credit,
        TransactionKind::Refund,
        TransactionKind::Withdrawal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Debit => "debit",
            TransactionKind::Credit => "credit",
            TransactionKind::Refund => "refund",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }

    /// Whether this kind adds to the balance.
    pub fn is_inflow(&self) -> bool {
        matches!(
            self,
            TransactionKind::Deposit | TransactionKind::Credit | TransactionKind::Refund
        )
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("unknown transaction kind: {0}")]
pub struct ParseKindError(pub String);

impl FromStr for TransactionKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseKindError(s.to_string()))
    }
}

/// Immutable record of one balance mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub wallet_id: WalletId,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub source: String,
    /// Idempotency key against external confirmations. Unique per `(wallet_id, kind)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        wallet_id: WalletId,
        kind: TransactionKind,
        amount: Decimal,
        source: impl Into<String>,
        notes: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            kind,
            amount,
            source: source.into(),
            external_reference: None,
            notes: notes.into(),
            created_at,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.external_reference = Some(reference.into());
        self
    }
}

/// Balance and accumulators, either as stored or as reconstructed from the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub balance: Decimal,
    pub total_deposits: Decimal,
    pub total_winnings: Decimal,
    pub total_losses: Decimal,
}

impl Totals {
    /// Apply one log entry.
    ///
    /// On overflow `self` is left untouched and the entry's amount is reported.
    pub fn apply(&mut self, transaction: &Transaction) -> Result<(), WalletError> {
        let amount = transaction.amount;
        let mut next = *self;
        match transaction.kind {
            TransactionKind::Deposit => {
                next.balance = checked_add(next.balance, amount)?;
                next.total_deposits = checked_add(next.total_deposits, amount)?;
            }
            TransactionKind::Credit => {
                next.balance = checked_add(next.balance, amount)?;
                next.total_winnings = checked_add(next.total_winnings, amount)?;
            }
            TransactionKind::Debit => {
                next.balance = checked_sub(next.balance, amount)?;
                next.total_losses = checked_add(next.total_losses, amount)?;
            }
            TransactionKind::Refund => next.balance = checked_add(next.balance, amount)?,
            TransactionKind::Withdrawal => next.balance = checked_sub(next.balance, amount)?,
        }
        *self = next;
        Ok(())
    }

    /// Reconstruct totals by replaying a log in any order.
    pub fn replay<'a>(
        transactions: impl IntoIterator<Item = &'a Transaction>,
    ) -> Result<Self, WalletError> {
        let mut totals = Totals::default();
        for transaction in transactions {
            totals.apply(transaction)?;
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(kind: TransactionKind, amount: Decimal) -> Transaction {
        Transaction::new(Uuid::nil(), kind, amount, "test", "", Utc::now())
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in TransactionKind::ALL {
            assert_eq!(kind.as_str().parse::<TransactionKind>(), Ok(kind));
        }
        assert!("bonus".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TransactionKind::Withdrawal).unwrap();
        assert_eq!(json, "\"withdrawal\"");
    }

    #[test]
    fn test_replay_reconstructs_accumulators() {
        let log = vec![
            entry(TransactionKind::Deposit, dec!(500)),
            entry(TransactionKind::Debit, dec!(100)),
            entry(TransactionKind::Credit, dec!(120)),
            entry(TransactionKind::Refund, dec!(10)),
            entry(TransactionKind::Withdrawal, dec!(30)),
        ];
        let totals = Totals::replay(&log).unwrap();
        assert_eq!(totals.balance, dec!(500));
        assert_eq!(totals.total_deposits, dec!(500));
        assert_eq!(totals.total_winnings, dec!(120));
        assert_eq!(totals.total_losses, dec!(100));
    }

    #[test]
    fn test_apply_rejects_overflow_without_mutation() {
        let mut totals = Totals {
            balance: Decimal::MAX,
            total_deposits: Decimal::MAX,
            ..Default::default()
        };
        let before = totals;
        assert_eq!(
            totals.apply(&entry(TransactionKind::Deposit, dec!(1))),
            Err(WalletError::InvalidAmount { amount: dec!(1) })
        );
        assert_eq!(totals, before);

        let log = vec![
            entry(TransactionKind::Credit, Decimal::MAX),
            entry(TransactionKind::Credit, Decimal::MAX),
        ];
        assert!(Totals::replay(&log).is_err());
    }

    #[test]
    fn test_new_wallet_is_empty() {
        let wallet = Wallet::new(UserId(7), Utc::now());
        assert_eq!(wallet.version, 0);
        assert_eq!(wallet.totals(), Totals::default());
        assert_eq!(wallet.snapshot().balance, Decimal::ZERO);
    }
}

use spinwallet_types::{AlgorithmConfiguration, Transaction, Wallet};

use crate::error::CommitError;
use crate::state::{Change, State};

/// A batch of changes staged against a [`State`] and committed as one unit.
pub struct Layer<'a, S: State> {
    state: &'a S,
    pending: Vec<Change>,
}

impl<'a, S: State> Layer<'a, S> {
    pub fn new(state: &'a S) -> Self {
        Self {
            state,
            pending: Vec::new(),
        }
    }

    pub fn put_wallet(&mut self, wallet: Wallet, expected_version: Option<u64>) {
        self.pending.push(Change::Wallet {
            wallet,
            expected_version,
        });
    }

    pub fn append(&mut self, transaction: Transaction) {
        self.pending.push(Change::Transaction(transaction));
    }

    pub fn put_configuration(&mut self, configuration: AlgorithmConfiguration) {
        self.pending.push(Change::Configuration(configuration));
    }

    pub fn extend(&mut self, changes: impl IntoIterator<Item = Change>) {
        self.pending.extend(changes);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Staged changes, in order.
    pub fn commit(self) -> Vec<Change> {
        self.pending
    }

    /// Apply every staged change atomically.
    pub async fn apply(self) -> Result<(), CommitError> {
        let state = self.state;
        let changes = self.commit();
        if changes.is_empty() {
            return Ok(());
        }
        state.apply(changes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Memory;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use spinwallet_types::{TransactionKind, UserId};

    #[tokio::test]
    async fn test_layer_applies_staged_changes_together() {
        let state = Memory::default();
        let wallet = Wallet::new(UserId(3), Utc::now());
        let mut layer = Layer::new(&state);
        layer.put_wallet(wallet.clone(), None);
        layer.append(Transaction::new(
            wallet.id,
            TransactionKind::Deposit,
            dec!(5),
            "test",
            "",
            Utc::now(),
        ));
        assert!(!layer.is_empty());
        layer.apply().await.unwrap();

        assert!(state.wallet(UserId(3)).await.unwrap().is_some());
        assert_eq!(state.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_layer_is_noop() {
        let state = Memory::default();
        Layer::new(&state).apply().await.unwrap();
        assert_eq!(state.transaction_count(), 0);
    }
}

use spinwallet_types::{Transaction, TransactionKind, Wallet, WalletId};
use std::sync::Arc;
use tracing::debug;

use crate::error::{CommitError, EngineError};
use crate::layer::Layer;
use crate::state::{Change, State, TransactionFilter};

/// Wallet row written in the same batch as the appended entries.
#[derive(Clone, Debug)]
pub struct WalletWrite {
    pub wallet: Wallet,
    pub expected_version: Option<u64>,
}

/// Append-only record of balance mutations.
///
/// The only writer of transaction rows. Every append travels in one batch with the wallet row it
/// moves, so the log and the balance can never disagree.
pub struct TransactionLog<S: State> {
    state: Arc<S>,
}

impl<S: State> Clone for TransactionLog<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<S: State> TransactionLog<S> {
    pub fn new(state: Arc<S>) -> Self {
        Self { state }
    }

    /// Append `entries` together with `wallet` and any `also` changes, atomically.
    pub async fn append(
        &self,
        entries: Vec<Transaction>,
        wallet: Option<WalletWrite>,
        also: Vec<Change>,
    ) -> Result<Vec<Transaction>, CommitError> {
        let mut layer = Layer::new(self.state.as_ref());
        if let Some(write) = wallet {
            layer.put_wallet(write.wallet, write.expected_version);
        }
        for entry in &entries {
            layer.append(entry.clone());
        }
        layer.extend(also);
        layer.apply().await?;
        Ok(entries)
    }

    /// Append `entry` unless its external reference is already recorded for the wallet and kind.
    ///
    /// Returns the stored row and whether this call created it. The lookup short-circuits the
    /// common repeat; the storage uniqueness constraint decides races between concurrent callers.
    pub async fn append_if_absent(
        &self,
        entry: Transaction,
        wallet: Option<WalletWrite>,
        also: Vec<Change>,
    ) -> Result<(Transaction, bool), EngineError> {
        let Some(reference) = entry.external_reference.clone() else {
            let mut appended = self.append(vec![entry], wallet, also).await?;
            return match appended.pop() {
                Some(entry) => Ok((entry, true)),
                None => Err(anyhow::anyhow!("append returned no entry").into()),
            };
        };
        if let Some(existing) = self.find(entry.wallet_id, &reference, entry.kind).await? {
            debug!(%reference, kind = %entry.kind, "reference already recorded");
            return Ok((existing, false));
        }
        let (wallet_id, kind) = (entry.wallet_id, entry.kind);
        match self.append(vec![entry.clone()], wallet, also).await {
            Ok(_) => Ok((entry, true)),
            Err(CommitError::Duplicate { .. }) => {
                debug!(%reference, %kind, "lost insert race on reference");
                match self.find(wallet_id, &reference, kind).await? {
                    Some(existing) => Ok((existing, false)),
                    None => Err(anyhow::anyhow!(
                        "duplicate {kind} for {reference} reported but not found"
                    )
                    .into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find(
        &self,
        wallet_id: WalletId,
        reference: &str,
        kind: TransactionKind,
    ) -> Result<Option<Transaction>, EngineError> {
        Ok(self
            .state
            .transaction_by_reference(wallet_id, reference, kind)
            .await?)
    }

    /// Newest first.
    pub async fn history(
        &self,
        wallet_id: WalletId,
        filter: TransactionFilter,
    ) -> Result<Vec<Transaction>, EngineError> {
        Ok(self.state.transactions(wallet_id, filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Memory;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use spinwallet_types::{UserId, SOURCE_DEPOSIT};

    async fn seeded() -> (TransactionLog<Memory>, Wallet) {
        let state = Arc::new(Memory::default());
        let log = TransactionLog::new(state);
        let wallet = Wallet::new(UserId(1), Utc::now());
        log.append(
            vec![],
            Some(WalletWrite {
                wallet: wallet.clone(),
                expected_version: None,
            }),
            vec![],
        )
        .await
        .unwrap();
        (log, wallet)
    }

    fn deposit(wallet: &Wallet, reference: &str) -> Transaction {
        Transaction::new(
            wallet.id,
            TransactionKind::Deposit,
            dec!(500),
            SOURCE_DEPOSIT,
            "",
            Utc::now(),
        )
        .with_reference(reference)
    }

    #[tokio::test]
    async fn test_append_if_absent_records_once() {
        let (log, wallet) = seeded().await;
        let (first, created) = log
            .append_if_absent(deposit(&wallet, "R1"), None, vec![])
            .await
            .unwrap();
        assert!(created);
        let (second, created) = log
            .append_if_absent(deposit(&wallet, "R1"), None, vec![])
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let rows = log.history(wallet.id, TransactionFilter::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_same_reference_different_kind_is_distinct() {
        let (log, wallet) = seeded().await;
        log.append_if_absent(deposit(&wallet, "R1"), None, vec![])
            .await
            .unwrap();
        let mut refund = deposit(&wallet, "R1");
        refund.kind = TransactionKind::Refund;
        let (_, created) = log.append_if_absent(refund, None, vec![]).await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_storage_constraint_backs_up_lookup() {
        let (log, wallet) = seeded().await;
        log.append(vec![deposit(&wallet, "R2")], None, vec![])
            .await
            .unwrap();
        // Bypassing the lookup hits the constraint.
        let err = log
            .append(vec![deposit(&wallet, "R2")], None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Duplicate { .. }));
    }
}

use anyhow::Result;
use chrono::{DateTime, Utc};
use spinwallet_types::{
    AlgorithmConfiguration, PaymentRequest, PaymentStatus, Transaction, TransactionKind, UserId,
    Wallet, WalletId,
};
use std::future::Future;
use uuid::Uuid;

use crate::error::CommitError;

#[cfg(any(test, feature = "mocks"))]
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

/// Number of rows `history` returns when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionFilter {
    pub kind: Option<TransactionKind>,
    pub limit: Option<usize>,
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self {
            kind: None,
            limit: Some(DEFAULT_HISTORY_LIMIT),
        }
    }
}

impl TransactionFilter {
    /// Every row, for audits.
    pub fn all() -> Self {
        Self {
            kind: None,
            limit: None,
        }
    }

    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One write within an atomic batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// Insert (`expected_version == None`) or compare-and-swap a wallet row.
    Wallet {
        wallet: Wallet,
        expected_version: Option<u64>,
    },
    /// Append a log row. Rejected with [`CommitError::Duplicate`] if its external reference is
    /// already recorded for the same wallet and kind.
    Transaction(Transaction),
    /// Insert (`expected_status == None`) or compare-and-swap a payment request on its status.
    Payment {
        payment: PaymentRequest,
        expected_status: Option<PaymentStatus>,
    },
    /// Upsert a configuration. Activation state is left as stored.
    Configuration(AlgorithmConfiguration),
    /// Clear every active flag, then set it on `name`.
    Activate { name: String, at: DateTime<Utc> },
    DeactivateAll,
}

/// Durable storage behind the wallet core.
///
/// Reads are snapshot reads. [`State::apply`] is the single commit point: it applies a whole batch
/// or nothing, enforcing every compare-and-swap and uniqueness constraint in the batch.
pub trait State: Send + Sync + 'static {
    fn wallet(&self, user: UserId) -> impl Future<Output = Result<Option<Wallet>>> + Send;

    /// Log rows for a wallet, newest first.
    fn transactions(
        &self,
        wallet_id: WalletId,
        filter: TransactionFilter,
    ) -> impl Future<Output = Result<Vec<Transaction>>> + Send;

    fn transaction_by_reference(
        &self,
        wallet_id: WalletId,
        reference: &str,
        kind: TransactionKind,
    ) -> impl Future<Output = Result<Option<Transaction>>> + Send;

    fn payment(&self, id: Uuid) -> impl Future<Output = Result<Option<PaymentRequest>>> + Send;

    fn payment_by_reference(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<Option<PaymentRequest>>> + Send;

    /// Requests in any of `statuses` initiated strictly before `initiated_before`.
    fn payments_in(
        &self,
        statuses: &[PaymentStatus],
        initiated_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<PaymentRequest>>> + Send;

    fn configurations(&self) -> impl Future<Output = Result<Vec<AlgorithmConfiguration>>> + Send;

    fn apply(&self, changes: Vec<Change>) -> impl Future<Output = Result<(), CommitError>> + Send;
}

#[cfg(any(test, feature = "mocks"))]
#[derive(Clone, Default)]
struct Tables {
    wallets: HashMap<UserId, Wallet>,
    transactions: Vec<Transaction>,
    references: HashSet<(WalletId, String, TransactionKind)>,
    payments: HashMap<Uuid, PaymentRequest>,
    configurations: BTreeMap<String, AlgorithmConfiguration>,
}

#[cfg(any(test, feature = "mocks"))]
impl Tables {
    fn stage(&mut self, change: Change) -> Result<(), CommitError> {
        match change {
            Change::Wallet {
                wallet,
                expected_version,
            } => {
                let stored = self.wallets.get(&wallet.user).map(|w| w.version);
                if stored != expected_version {
                    return Err(CommitError::StaleWallet {
                        user: wallet.user,
                        expected: expected_version,
                    });
                }
                self.wallets.insert(wallet.user, wallet);
            }
            Change::Transaction(transaction) => {
                if let Some(reference) = &transaction.external_reference {
                    let key = (transaction.wallet_id, reference.clone(), transaction.kind);
                    if !self.references.insert(key) {
                        return Err(CommitError::Duplicate {
                            wallet_id: transaction.wallet_id,
                            reference: reference.clone(),
                            kind: transaction.kind,
                        });
                    }
                }
                self.transactions.push(transaction);
            }
            Change::Payment {
                payment,
                expected_status,
            } => {
                let stored = self.payments.get(&payment.id).map(|p| p.status);
                if stored != expected_status {
                    return Err(CommitError::StalePayment { id: payment.id });
                }
                if let Some(reference) = &payment.checkout_reference {
                    let taken = self.payments.values().any(|other| {
                        other.id != payment.id
                            && other.checkout_reference.as_deref() == Some(reference)
                    });
                    if taken {
                        return Err(CommitError::DuplicateCheckout {
                            reference: reference.clone(),
                        });
                    }
                }
                self.payments.insert(payment.id, payment);
            }
            Change::Configuration(mut configuration) => {
                match self.configurations.get(&configuration.name) {
                    Some(existing) => {
                        configuration.is_active = existing.is_active;
                        configuration.activated_at = existing.activated_at;
                        configuration.created_at = existing.created_at;
                    }
                    None => {
                        configuration.is_active = false;
                        configuration.activated_at = None;
                    }
                }
                self.configurations
                    .insert(configuration.name.clone(), configuration);
            }
            Change::Activate { name, at } => {
                if !self.configurations.contains_key(&name) {
                    return Err(CommitError::MissingConfiguration { name });
                }
                for configuration in self.configurations.values_mut() {
                    configuration.is_active = false;
                }
                if let Some(target) = self.configurations.get_mut(&name) {
                    target.is_active = true;
                    target.activated_at = Some(at);
                }
            }
            Change::DeactivateAll => {
                for configuration in self.configurations.values_mut() {
                    configuration.is_active = false;
                }
            }
        }
        Ok(())
    }
}

/// In-memory [`State`] for tests.
#[cfg(any(test, feature = "mocks"))]
#[derive(Default)]
pub struct Memory {
    tables: Mutex<Tables>,
    contended: bool,
    injected_stale: AtomicU32,
}

#[cfg(any(test, feature = "mocks"))]
impl Memory {
    /// Yields to the scheduler before every access so concurrent callers interleave between
    /// their reads and their commit.
    pub fn contended() -> Self {
        Self {
            contended: true,
            ..Default::default()
        }
    }

    /// Reject the next `count` batches that write a wallet with [`CommitError::StaleWallet`].
    pub fn inject_stale_wallets(&self, count: u32) {
        self.injected_stale.store(count, Ordering::SeqCst);
    }

    /// Number of log rows across all wallets.
    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pause(&self) {
        if self.contended {
            tokio::task::yield_now().await;
        }
    }

    fn take_injected_stale(&self) -> bool {
        self.injected_stale
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(any(test, feature = "mocks"))]
impl State for Memory {
    async fn wallet(&self, user: UserId) -> Result<Option<Wallet>> {
        self.pause().await;
        Ok(self.lock().wallets.get(&user).cloned())
    }

    async fn transactions(
        &self,
        wallet_id: WalletId,
        filter: TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        self.pause().await;
        let tables = self.lock();
        let rows = tables
            .transactions
            .iter()
            .rev()
            .filter(|t| t.wallet_id == wallet_id)
            .filter(|t| filter.kind.map_or(true, |kind| t.kind == kind))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn transaction_by_reference(
        &self,
        wallet_id: WalletId,
        reference: &str,
        kind: TransactionKind,
    ) -> Result<Option<Transaction>> {
        self.pause().await;
        Ok(self
            .lock()
            .transactions
            .iter()
            .find(|t| {
                t.wallet_id == wallet_id
                    && t.kind == kind
                    && t.external_reference.as_deref() == Some(reference)
            })
            .cloned())
    }

    async fn payment(&self, id: Uuid) -> Result<Option<PaymentRequest>> {
        self.pause().await;
        Ok(self.lock().payments.get(&id).cloned())
    }

    async fn payment_by_reference(&self, reference: &str) -> Result<Option<PaymentRequest>> {
        self.pause().await;
        Ok(self
            .lock()
            .payments
            .values()
            .find(|p| p.checkout_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn payments_in(
        &self,
        statuses: &[PaymentStatus],
        initiated_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentRequest>> {
        self.pause().await;
        let mut found: Vec<PaymentRequest> = self
            .lock()
            .payments
            .values()
            .filter(|p| statuses.contains(&p.status) && p.initiated_at < initiated_before)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.initiated_at);
        Ok(found)
    }

    async fn configurations(&self) -> Result<Vec<AlgorithmConfiguration>> {
        self.pause().await;
        Ok(self.lock().configurations.values().cloned().collect())
    }

    async fn apply(&self, changes: Vec<Change>) -> Result<(), CommitError> {
        self.pause().await;
        if let Some(Change::Wallet {
            wallet,
            expected_version,
        }) = changes.iter().find(|c| matches!(c, Change::Wallet { .. }))
        {
            if self.take_injected_stale() {
                return Err(CommitError::StaleWallet {
                    user: wallet.user,
                    expected: *expected_version,
                });
            }
        }

        let mut tables = self.lock();
        let mut staged = tables.clone();
        for change in changes {
            staged.stage(change)?;
        }
        *tables = staged;
        Ok(())
    }
}

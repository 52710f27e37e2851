use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use spinwallet_types::{
    money::{format_amount, validate_amount, MONEY_SCALE},
    BalanceSnapshot, Totals, Transaction, TransactionKind, UserId, Wallet, WalletError, WalletId,
    SOURCE_DEPOSIT, SOURCE_REFUND, SOURCE_WITHDRAWAL,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::retry_delay;
use crate::error::{CommitError, EngineError};
use crate::state::{Change, State, TransactionFilter};
use crate::transaction_log::{TransactionLog, WalletWrite};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Compare-and-swap attempts before surfacing `ConcurrencyConflict`.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub backoff: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: Duration::from_millis(5),
        }
    }
}

/// Outcome of [`Ledger::apply_atomic`].
#[derive(Clone, Debug, PartialEq)]
pub struct AtomicReceipt {
    pub debit: Transaction,
    /// `None` when the credit amount was zero.
    pub credit: Option<Transaction>,
    pub wallet: Wallet,
}

/// Stored accumulators compared against a replay of the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub user: UserId,
    pub wallet_id: WalletId,
    pub stored: Totals,
    pub replayed: Totals,
    pub entries: usize,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.replayed
    }
}

/// One log entry to be written by a ledger commit.
struct Posting {
    kind: TransactionKind,
    amount: Decimal,
    source: String,
    notes: String,
    reference: Option<String>,
}

impl Posting {
    fn new(kind: TransactionKind, amount: Decimal, source: &str, notes: &str) -> Self {
        Self {
            kind,
            amount,
            source: source.to_string(),
            notes: notes.to_string(),
            reference: None,
        }
    }

    fn with_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    fn entry(&self, wallet_id: WalletId, now: DateTime<Utc>) -> Transaction {
        let entry = Transaction::new(
            wallet_id,
            self.kind,
            self.amount,
            self.source.clone(),
            self.notes.clone(),
            now,
        );
        match &self.reference {
            Some(reference) => entry.with_reference(reference.clone()),
            None => entry,
        }
    }
}

struct Posted {
    wallet: Wallet,
    entries: Vec<Transaction>,
    created: bool,
}

/// Per-user balances with optimistic concurrency.
///
/// Every mutation reads the wallet and its version, computes the next state (including the
/// funds check), and commits the wallet row together with its log rows only if the version is
/// unchanged. A lost race re-reads and tries again after a jittered backoff.
pub struct Ledger<S: State> {
    state: Arc<S>,
    log: TransactionLog<S>,
    config: LedgerConfig,
}

impl<S: State> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            log: self.log.clone(),
            config: self.config,
        }
    }
}

impl<S: State> Ledger<S> {
    pub fn new(state: Arc<S>, config: LedgerConfig) -> Self {
        Self {
            log: TransactionLog::new(state.clone()),
            state,
            config,
        }
    }

    pub fn log(&self) -> &TransactionLog<S> {
        &self.log
    }

    /// The user's wallet, created empty on first access.
    pub async fn wallet(&self, user: UserId) -> Result<Wallet, EngineError> {
        if let Some(wallet) = self.state.wallet(user).await? {
            return Ok(wallet);
        }
        let wallet = Wallet::new(user, Utc::now());
        let write = WalletWrite {
            wallet: wallet.clone(),
            expected_version: None,
        };
        match self.log.append(vec![], Some(write), vec![]).await {
            Ok(_) => {
                info!(%user, wallet = %wallet.id, "wallet created");
                Ok(wallet)
            }
            // Created concurrently by another caller.
            Err(CommitError::StaleWallet { .. }) => self
                .state
                .wallet(user)
                .await?
                .ok_or_else(|| anyhow!("wallet for user {user} missing after create").into()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn balance(&self, user: UserId) -> Result<BalanceSnapshot, EngineError> {
        Ok(self.wallet(user).await?.snapshot())
    }

    /// Log rows newest first.
    pub async fn history(
        &self,
        user: UserId,
        filter: TransactionFilter,
    ) -> Result<Vec<Transaction>, EngineError> {
        let wallet = self.wallet(user).await?;
        self.log.history(wallet.id, filter).await
    }

    pub async fn debit(
        &self,
        user: UserId,
        amount: Decimal,
        source: &str,
        notes: &str,
    ) -> Result<Transaction, EngineError> {
        let amount = validate_amount(amount)?;
        let posting = Posting::new(TransactionKind::Debit, amount, source, notes);
        self.single(user, posting, vec![]).await
    }

    pub async fn credit(
        &self,
        user: UserId,
        amount: Decimal,
        source: &str,
        notes: &str,
    ) -> Result<Transaction, EngineError> {
        let amount = validate_amount(amount)?;
        let posting = Posting::new(TransactionKind::Credit, amount, source, notes);
        self.single(user, posting, vec![]).await
    }

    pub async fn withdraw(
        &self,
        user: UserId,
        amount: Decimal,
        notes: &str,
    ) -> Result<Transaction, EngineError> {
        let amount = validate_amount(amount)?;
        let posting = Posting::new(TransactionKind::Withdrawal, amount, SOURCE_WITHDRAWAL, notes);
        self.single(user, posting, vec![]).await
    }

    /// Credit a confirmed external deposit at most once per `reference`.
    ///
    /// Returns the deposit row and whether this call created it.
    pub async fn deposit(
        &self,
        user: UserId,
        amount: Decimal,
        reference: &str,
        notes: &str,
    ) -> Result<(Transaction, bool), EngineError> {
        self.deposit_with(user, amount, reference, notes, vec![])
            .await
    }

    /// [`Ledger::deposit`], committing `also` in the same batch when the deposit is new.
    pub async fn deposit_with(
        &self,
        user: UserId,
        amount: Decimal,
        reference: &str,
        notes: &str,
        also: Vec<Change>,
    ) -> Result<(Transaction, bool), EngineError> {
        let amount = validate_amount(amount)?;
        let posting = Posting::new(TransactionKind::Deposit, amount, SOURCE_DEPOSIT, notes)
            .with_reference(reference);
        self.idempotent(user, posting, also).await
    }

    /// Return funds at most once per `reference`.
    pub async fn refund(
        &self,
        user: UserId,
        amount: Decimal,
        reference: &str,
        notes: &str,
    ) -> Result<(Transaction, bool), EngineError> {
        let amount = validate_amount(amount)?;
        let posting = Posting::new(TransactionKind::Refund, amount, SOURCE_REFUND, notes)
            .with_reference(reference);
        self.idempotent(user, posting, vec![]).await
    }

    /// Debit `debit` and credit `credit` in one commit.
    ///
    /// The funds check covers the debit alone. A zero credit writes no credit row.
    pub async fn apply_atomic(
        &self,
        user: UserId,
        debit: Decimal,
        credit: Decimal,
        sources: (&str, &str),
        notes: &str,
    ) -> Result<AtomicReceipt, EngineError> {
        let debit = validate_amount(debit)?;
        if credit.is_sign_negative() || credit.normalize().scale() > MONEY_SCALE {
            return Err(WalletError::InvalidAmount { amount: credit }.into());
        }
        let mut postings = vec![Posting::new(TransactionKind::Debit, debit, sources.0, notes)];
        if !credit.is_zero() {
            postings.push(Posting::new(
                TransactionKind::Credit,
                credit,
                sources.1,
                notes,
            ));
        }
        let posted = self.post(user, postings, vec![], false).await?;
        let mut entries = posted.entries.into_iter();
        let debit = entries
            .next()
            .ok_or_else(|| anyhow!("atomic commit returned no debit"))?;
        Ok(AtomicReceipt {
            debit,
            credit: entries.next(),
            wallet: posted.wallet,
        })
    }

    /// Replay the log and compare it with the stored accumulators.
    pub async fn audit(&self, user: UserId) -> Result<AuditReport, EngineError> {
        let wallet = self.wallet(user).await?;
        let entries = self.log.history(wallet.id, TransactionFilter::all()).await?;
        let report = AuditReport {
            user,
            wallet_id: wallet.id,
            stored: wallet.totals(),
            replayed: Totals::replay(&entries)?,
            entries: entries.len(),
        };
        if !report.is_consistent() {
            warn!(%user, wallet = %wallet.id, ?report, "ledger audit mismatch");
        }
        Ok(report)
    }

    async fn single(
        &self,
        user: UserId,
        posting: Posting,
        also: Vec<Change>,
    ) -> Result<Transaction, EngineError> {
        let posted = self.post(user, vec![posting], also, false).await?;
        posted
            .entries
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("commit returned no entry").into())
    }

    async fn idempotent(
        &self,
        user: UserId,
        posting: Posting,
        also: Vec<Change>,
    ) -> Result<(Transaction, bool), EngineError> {
        let posted = self.post(user, vec![posting], also, true).await?;
        let created = posted.created;
        let entry = posted
            .entries
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("commit returned no entry"))?;
        Ok((entry, created))
    }

    /// Compare-and-swap loop shared by every mutation.
    async fn post(
        &self,
        user: UserId,
        postings: Vec<Posting>,
        also: Vec<Change>,
        idempotent: bool,
    ) -> Result<Posted, EngineError> {
        for attempt in 1..=self.config.max_attempts {
            let now = Utc::now();
            let (current, expected_version) = match self.state.wallet(user).await? {
                Some(wallet) => {
                    let version = wallet.version;
                    (wallet, Some(version))
                }
                None => (Wallet::new(user, now), None),
            };

            let entries: Vec<Transaction> =
                postings.iter().map(|p| p.entry(current.id, now)).collect();
            let mut totals = current.totals();
            for entry in &entries {
                if !entry.kind.is_inflow() && totals.balance < entry.amount {
                    warn!(
                        %user,
                        wallet = %current.id,
                        required = %entry.amount,
                        available = %totals.balance,
                        "insufficient funds"
                    );
                    return Err(WalletError::InsufficientFunds {
                        required: entry.amount,
                        available: totals.balance,
                    }
                    .into());
                }
                if let Err(err) = totals.apply(entry) {
                    warn!(
                        %user,
                        wallet = %current.id,
                        kind = %entry.kind,
                        amount = %entry.amount,
                        "ledger totals would overflow"
                    );
                    return Err(err.into());
                }
            }
            let mut next = current.clone();
            next.set_totals(totals);
            next.version = current.version + 1;
            next.updated_at = now;
            let write = WalletWrite {
                wallet: next.clone(),
                expected_version,
            };

            let result = if idempotent {
                match entries.into_iter().next() {
                    Some(entry) => self
                        .log
                        .append_if_absent(entry, Some(write), also.clone())
                        .await
                        .map(|(entry, created)| (vec![entry], created)),
                    None => return Err(anyhow!("idempotent commit without entry").into()),
                }
            } else {
                self.log
                    .append(entries, Some(write), also.clone())
                    .await
                    .map(|entries| (entries, true))
                    .map_err(EngineError::from)
            };

            match result {
                Ok((entries, true)) => {
                    for entry in &entries {
                        info!(
                            %user,
                            wallet = %next.id,
                            kind = %entry.kind,
                            amount = %format_amount(entry.amount),
                            source = %entry.source,
                            balance = %next.balance,
                            "ledger entry committed"
                        );
                    }
                    return Ok(Posted {
                        wallet: next,
                        entries,
                        created: true,
                    });
                }
                Ok((entries, false)) => {
                    return Ok(Posted {
                        wallet: current,
                        entries,
                        created: false,
                    });
                }
                Err(EngineError::Commit(CommitError::StaleWallet { .. })) => {
                    debug!(%user, attempt, "wallet version moved, retrying");
                    if attempt < self.config.max_attempts {
                        let delay =
                            retry_delay(&mut rand::thread_rng(), self.config.backoff, attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        warn!(%user, attempts = self.config.max_attempts, "wallet commit retries exhausted");
        Err(WalletError::ConcurrencyConflict {
            user,
            attempts: self.config.max_attempts,
        }
        .into())
    }
}

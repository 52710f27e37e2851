use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use spinwallet_types::{
    api::{ConfirmationAck, PaymentConfirmation, PaymentStatusQuery, PaymentStatusResponse},
    money::{format_amount, validate_amount},
    PaymentOutcome, PaymentRequest, PaymentStatus, Transaction, UserId, WalletError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

use crate::error::{CommitError, EngineError};
use crate::ledger::Ledger;
use crate::state::{Change, State};

/// Provider acknowledgement of a push request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderAck {
    pub checkout_reference: String,
    pub message: String,
}

#[derive(Debug, ThisError)]
pub enum ProviderError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// External mobile-money provider that prompts the payer and later confirms out of band.
pub trait PaymentProvider: Send + Sync {
    fn request_payment(
        &self,
        request: &PaymentRequest,
    ) -> impl Future<Output = Result<ProviderAck, ProviderError>> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaymentConfig {
    /// Bound on waiting for the provider to acknowledge an initiation.
    pub initiation_timeout: Duration,
    /// Age after which an unconfirmed request is expired by the sweep.
    pub expiry: Duration,
    /// Attempts at a reconciliation that keeps losing status races.
    pub max_attempts: u32,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            initiation_timeout: Duration::from_secs(30),
            expiry: Duration::from_secs(300),
            max_attempts: 8,
        }
    }
}

/// Result of applying one confirmation.
#[derive(Clone, Debug, PartialEq)]
pub enum Reconciliation {
    /// This delivery moved the request to its terminal state.
    Applied {
        payment: PaymentRequest,
        deposit: Option<Transaction>,
    },
    /// The request was already in the reported terminal state.
    Duplicate { payment: PaymentRequest },
}

impl Reconciliation {
    pub fn payment(&self) -> &PaymentRequest {
        match self {
            Reconciliation::Applied { payment, .. } | Reconciliation::Duplicate { payment } => {
                payment
            }
        }
    }

    pub fn is_first_delivery(&self) -> bool {
        matches!(self, Reconciliation::Applied { .. })
    }
}

/// Normalise a Kenyan mobile number to `254XXXXXXXXX`.
///
/// Accepts local (`07..`, `01..`), bare subscriber (`7..`) and international (`254..`, `+254..`)
/// forms, with optional spaces or dashes.
pub fn normalize_phone(raw: &str) -> Result<String, WalletError> {
    let invalid = || WalletError::InvalidPhone {
        phone: raw.to_string(),
    };
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let subscriber = if let Some(rest) = digits.strip_prefix("254") {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits
    };
    if subscriber.len() != 9 || !(subscriber.starts_with('7') || subscriber.starts_with('1')) {
        return Err(invalid());
    }
    Ok(format!("254{subscriber}"))
}

/// Drives payment requests through `initiated -> pending -> {success, failed, expired}` and
/// credits each confirmed deposit exactly once.
pub struct PaymentReconciler<S: State> {
    state: Arc<S>,
    ledger: Ledger<S>,
    config: PaymentConfig,
}

impl<S: State> Clone for PaymentReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            ledger: self.ledger.clone(),
            config: self.config,
        }
    }
}

impl<S: State> PaymentReconciler<S> {
    pub fn new(state: Arc<S>, ledger: Ledger<S>, config: PaymentConfig) -> Self {
        Self {
            state,
            ledger,
            config,
        }
    }

    /// Record a request and push it to `provider`.
    ///
    /// The request is stored as `initiated` before the provider is contacted. If the provider
    /// refuses, or does not acknowledge within the initiation timeout, the request is marked
    /// `failed` and the error is returned.
    pub async fn initiate<P: PaymentProvider>(
        &self,
        provider: &P,
        user: UserId,
        amount: Decimal,
        phone: &str,
    ) -> Result<PaymentRequest, EngineError> {
        let amount = validate_amount(amount)?;
        let phone = normalize_phone(phone)?;
        let record = PaymentRequest::new(user, amount, phone, Utc::now());
        self.state
            .apply(vec![Change::Payment {
                payment: record.clone(),
                expected_status: None,
            }])
            .await?;
        info!(payment = %record.id, %user, amount = %format_amount(amount), "payment initiated");

        let acknowledged = tokio::time::timeout(
            self.config.initiation_timeout,
            provider.request_payment(&record),
        )
        .await;
        match acknowledged {
            Ok(Ok(ack)) => self.mark_pending(&record, ack).await,
            Ok(Err(err)) => {
                let reason = err.to_string();
                warn!(payment = %record.id, %reason, "provider refused payment request");
                self.fail(&record, &reason).await?;
                Err(WalletError::Provider { reason }.into())
            }
            Err(_) => {
                warn!(
                    payment = %record.id,
                    timeout_ms = self.config.initiation_timeout.as_millis() as u64,
                    "provider acknowledgement timed out"
                );
                self.fail(&record, "provider acknowledgement timed out")
                    .await?;
                Err(WalletError::PaymentTimedOut { id: record.id }.into())
            }
        }
    }

    async fn mark_pending(
        &self,
        record: &PaymentRequest,
        ack: ProviderAck,
    ) -> Result<PaymentRequest, EngineError> {
        let mut pending = record.transitioned(PaymentStatus::Pending, Utc::now(), None);
        pending.checkout_reference = Some(ack.checkout_reference.clone());
        let change = Change::Payment {
            payment: pending.clone(),
            expected_status: Some(record.status),
        };
        match self.state.apply(vec![change]).await {
            Ok(()) => {
                info!(
                    payment = %record.id,
                    reference = %ack.checkout_reference,
                    "payment pending confirmation"
                );
                Ok(pending)
            }
            Err(CommitError::StalePayment { .. }) => {
                // Expired by the sweep while the provider was answering.
                warn!(payment = %record.id, "payment moved before acknowledgement was stored");
                self.state
                    .payment(record.id)
                    .await?
                    .ok_or_else(|| anyhow!("payment {} missing", record.id).into())
            }
            Err(CommitError::DuplicateCheckout { reference }) => {
                let reason = format!("provider reused checkout reference {reference}");
                error!(payment = %record.id, %reference, "duplicate checkout reference");
                self.fail(record, &reason).await?;
                Err(WalletError::Provider { reason }.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn fail(&self, record: &PaymentRequest, reason: &str) -> Result<(), EngineError> {
        let failed = record.transitioned(PaymentStatus::Failed, Utc::now(), Some(reason.into()));
        let change = Change::Payment {
            payment: failed,
            expected_status: Some(record.status),
        };
        match self.state.apply(vec![change]).await {
            Ok(()) => Ok(()),
            Err(CommitError::StalePayment { .. }) => {
                debug!(payment = %record.id, "payment already moved; failure not recorded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn status_of(&self, reference: &str) -> Result<PaymentRequest, EngineError> {
        self.state
            .payment_by_reference(reference)
            .await?
            .ok_or_else(|| {
                WalletError::PaymentNotFound {
                    reference: reference.to_string(),
                }
                .into()
            })
    }

    pub async fn query(
        &self,
        query: &PaymentStatusQuery,
    ) -> Result<PaymentStatusResponse, EngineError> {
        let record = self.status_of(&query.checkout_reference).await?;
        Ok(PaymentStatusResponse::from(&record))
    }

    /// Apply a provider confirmation.
    ///
    /// A repeat of the recorded terminal outcome is a no-op returning the stored record. A
    /// different outcome for a terminal request is rejected and the record is left as is. A first
    /// success credits the deposit and moves the request to `success` in one commit.
    pub async fn reconcile(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> Result<Reconciliation, EngineError> {
        let reference = confirmation.checkout_reference.as_str();
        let attempted = confirmation.outcome;
        for attempt in 1..=self.config.max_attempts {
            let record = self.status_of(reference).await?;
            if let Some(recorded) = record.status.outcome() {
                if recorded == attempted {
                    debug!(%reference, status = %record.status, "duplicate confirmation");
                    return Ok(Reconciliation::Duplicate { payment: record });
                }
                error!(
                    %reference,
                    payment = %record.id,
                    status = %record.status,
                    ?recorded,
                    ?attempted,
                    "conflicting confirmation for terminal payment"
                );
                return Err(WalletError::ConflictingReconciliation {
                    reference: reference.to_string(),
                    existing: record.status,
                    attempted,
                }
                .into());
            }

            let now = Utc::now();
            let applied = match attempted {
                PaymentOutcome::Failed => {
                    let message = confirmation
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "payment failed".to_string());
                    self.settle_failed(&record, message, now).await?
                }
                PaymentOutcome::Success => {
                    if let Some(reported) = confirmation.amount {
                        if reported != record.amount {
                            error!(
                                %reference,
                                expected = %record.amount,
                                %reported,
                                "confirmation amount mismatch"
                            );
                            return Err(WalletError::AmountMismatch {
                                reference: reference.to_string(),
                                expected: record.amount,
                                reported,
                            }
                            .into());
                        }
                    }
                    self.settle_success(&record, reference, now).await?
                }
            };
            match applied {
                Some(result) => return Ok(result),
                None => debug!(%reference, attempt, "payment status moved, retrying"),
            }
        }
        let record = self.status_of(reference).await?;
        Err(WalletError::ConcurrencyConflict {
            user: record.user,
            attempts: self.config.max_attempts,
        }
        .into())
    }

    /// `None` when the record changed underneath and the caller should re-read.
    async fn settle_failed(
        &self,
        record: &PaymentRequest,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<Option<Reconciliation>, EngineError> {
        let failed = record.transitioned(PaymentStatus::Failed, now, Some(message));
        let change = Change::Payment {
            payment: failed.clone(),
            expected_status: Some(record.status),
        };
        match self.state.apply(vec![change]).await {
            Ok(()) => {
                info!(payment = %record.id, reference = ?record.checkout_reference, "payment failed");
                Ok(Some(Reconciliation::Applied {
                    payment: failed,
                    deposit: None,
                }))
            }
            Err(CommitError::StalePayment { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn settle_success(
        &self,
        record: &PaymentRequest,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Reconciliation>, EngineError> {
        let settled = record.transitioned(PaymentStatus::Success, now, None);
        let transition = Change::Payment {
            payment: settled.clone(),
            expected_status: Some(record.status),
        };
        let notes = format!("mobile money deposit {reference}");
        let deposited = self
            .ledger
            .deposit_with(
                record.user,
                record.amount,
                reference,
                &notes,
                vec![transition.clone()],
            )
            .await;
        match deposited {
            Ok((deposit, true)) => {
                info!(
                    payment = %record.id,
                    %reference,
                    amount = %format_amount(record.amount),
                    "deposit reconciled"
                );
                Ok(Some(Reconciliation::Applied {
                    payment: settled,
                    deposit: Some(deposit),
                }))
            }
            Ok((_, false)) => {
                // The credit exists; only the status is behind.
                warn!(%reference, "deposit already recorded, completing payment status");
                match self.state.apply(vec![transition]).await {
                    Ok(()) => Ok(Some(Reconciliation::Duplicate { payment: settled })),
                    Err(CommitError::StalePayment { .. }) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
            Err(EngineError::Commit(CommitError::StalePayment { .. })) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reconcile and acknowledge. Never fails: errors are logged and reported in the ack.
    pub async fn handle_confirmation(&self, confirmation: &PaymentConfirmation) -> ConfirmationAck {
        let reference = confirmation.checkout_reference.clone();
        match self.reconcile(confirmation).await {
            Ok(result) => ConfirmationAck {
                checkout_reference: reference,
                accepted: true,
                first_delivery: result.is_first_delivery(),
                message: if result.is_first_delivery() {
                    format!("payment {}", result.payment().status)
                } else {
                    "already processed".to_string()
                },
            },
            Err(err) => {
                if !matches!(
                    err.as_wallet(),
                    Some(WalletError::ConflictingReconciliation { .. })
                        | Some(WalletError::AmountMismatch { .. })
                ) {
                    warn!(%reference, %err, "confirmation not applied");
                }
                ConfirmationAck {
                    checkout_reference: reference,
                    accepted: false,
                    first_delivery: false,
                    message: err.to_string(),
                }
            }
        }
    }

    /// Expire every `initiated` or `pending` request older than the configured expiry.
    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentRequest>, EngineError> {
        let expiry = chrono::Duration::from_std(self.config.expiry)
            .map_err(|err| anyhow!("invalid payment expiry: {err}"))?;
        let cutoff = now - expiry;
        let stale = self
            .state
            .payments_in(&[PaymentStatus::Initiated, PaymentStatus::Pending], cutoff)
            .await?;
        let mut expired = Vec::with_capacity(stale.len());
        for record in stale {
            let message = format!(
                "no confirmation within {}s",
                self.config.expiry.as_secs()
            );
            let next = record.transitioned(PaymentStatus::Expired, now, Some(message));
            let change = Change::Payment {
                payment: next.clone(),
                expected_status: Some(record.status),
            };
            match self.state.apply(vec![change]).await {
                Ok(()) => {
                    info!(payment = %record.id, reference = ?record.checkout_reference, "payment expired");
                    expired.push(next);
                }
                Err(CommitError::StalePayment { .. }) => {
                    debug!(payment = %record.id, "payment settled before expiry");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone_accepts_common_forms() {
        for raw in [
            "0712345678",
            "712345678",
            "254712345678",
            "+254712345678",
            "+254 712 345 678",
            "254-712-345-678",
        ] {
            assert_eq!(normalize_phone(raw).unwrap(), "254712345678", "{raw}");
        }
        assert_eq!(normalize_phone("0112345678").unwrap(), "254112345678");
    }

    #[test]
    fn test_normalize_phone_rejects_garbage() {
        for raw in ["", "+", "07123", "0812345678", "25471234567x", "44712345678", "07123456789"] {
            assert!(
                matches!(normalize_phone(raw), Err(WalletError::InvalidPhone { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_reconciliation_accessors() {
        let payment = PaymentRequest::new(
            UserId(1),
            Decimal::ONE_HUNDRED,
            "254712345678".into(),
            Utc::now(),
        );
        let duplicate = Reconciliation::Duplicate {
            payment: payment.clone(),
        };
        assert!(!duplicate.is_first_delivery());
        assert_eq!(duplicate.payment(), &payment);
    }
}

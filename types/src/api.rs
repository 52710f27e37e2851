//! Request and response shapes exchanged with the web layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::payment::{PaymentOutcome, PaymentRequest, PaymentStatus};

/// Default ceiling on draws per spin request.
pub const DEFAULT_MAX_SPINS: u32 = 100;

/// Default unit cost of one spin.
pub const DEFAULT_SPIN_COST: Decimal = Decimal::from_parts(20, 0, 0, false, 0);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinRequest {
    pub unit_cost: Decimal,
    pub count: u32,
}

impl Default for SpinRequest {
    fn default() -> Self {
        Self {
            unit_cost: DEFAULT_SPIN_COST,
            count: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusQuery {
    pub checkout_reference: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusResponse {
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<&PaymentRequest> for PaymentStatusResponse {
    fn from(request: &PaymentRequest) -> Self {
        Self {
            status: request.status,
            amount: request.amount,
            initiated_at: request.initiated_at,
            completed_at: request.completed_at,
            error_message: request.error_message.clone(),
        }
    }
}

/// Provider callback body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub checkout_reference: String,
    pub outcome: PaymentOutcome,
    /// Amount the provider reports as paid. Checked against the request on success.
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl PaymentConfirmation {
    pub fn success(reference: impl Into<String>, amount: Decimal) -> Self {
        Self {
            checkout_reference: reference.into(),
            outcome: PaymentOutcome::Success,
            amount: Some(amount),
            error_message: None,
        }
    }

    pub fn failed(reference: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            checkout_reference: reference.into(),
            outcome: PaymentOutcome::Failed,
            amount: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Returned to the provider for every delivery, first or repeated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationAck {
    pub checkout_reference: String,
    /// Whether the delivery is consistent with the stored record.
    pub accepted: bool,
    /// Whether this delivery changed state.
    pub first_delivery: bool,
    pub message: String,
}

/// Error body handed to the web layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&WalletError> for ErrorBody {
    fn from(err: &WalletError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_transient(),
        }
    }
}

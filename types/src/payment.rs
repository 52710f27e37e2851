use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::wallet::UserId;

/// Lifecycle of a mobile-money deposit request.
///
/// `Initiated -> Pending -> {Success | Failed | Expired}`. Terminal states never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Success,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::Initiated,
        PaymentStatus::Pending,
        PaymentStatus::Success,
        PaymentStatus::Failed,
        PaymentStatus::Expired,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Success | PaymentStatus::Failed | PaymentStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "initiated",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }

    /// The confirmation outcome that produced this status, if any.
    pub fn outcome(&self) -> Option<PaymentOutcome> {
        match self {
            PaymentStatus::Success => Some(PaymentOutcome::Success),
            PaymentStatus::Failed | PaymentStatus::Expired => Some(PaymentOutcome::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("unknown payment status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for PaymentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Result reported by the provider's confirmation callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Success,
    Failed,
}

impl From<PaymentOutcome> for PaymentStatus {
    fn from(outcome: PaymentOutcome) -> Self {
        match outcome {
            PaymentOutcome::Success => PaymentStatus::Success,
            PaymentOutcome::Failed => PaymentStatus::Failed,
        }
    }
}

/// A deposit awaiting (or having received) external confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub user: UserId,
    pub amount: Decimal,
    /// Normalised `254XXXXXXXXX` form.
    pub phone: String,
    /// Provider checkout id. Unique once assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_reference: Option<String>,
    pub status: PaymentStatus,
    pub initiated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PaymentRequest {
    pub fn new(user: UserId, amount: Decimal, phone: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            amount,
            phone,
            checkout_reference: None,
            status: PaymentStatus::Initiated,
            initiated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    /// Copy of this request moved to `status`; terminal states stamp `completed_at`.
    pub fn transitioned(
        &self,
        status: PaymentStatus,
        now: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Self {
        let mut next = self.clone();
        next.status = status;
        if status.is_terminal() {
            next.completed_at = Some(now);
        }
        if error_message.is_some() {
            next.error_message = error_message;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_terminal_states() {
        assert!(!PaymentStatus::Initiated.is_terminal());
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Success.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Expired.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        for status in PaymentStatus::ALL {
            assert_eq!(status.as_str().parse::<PaymentStatus>(), Ok(status));
        }
        assert!("settled".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_transition_stamps_completion_only_when_terminal() {
        let now = Utc::now();
        let request = PaymentRequest::new(UserId(1), dec!(50), "254712345678".into(), now);
        let pending = request.transitioned(PaymentStatus::Pending, now, None);
        assert!(pending.completed_at.is_none());
        let failed = pending.transitioned(PaymentStatus::Failed, now, Some("cancelled".into()));
        assert_eq!(failed.completed_at, Some(now));
        assert_eq!(failed.error_message.as_deref(), Some("cancelled"));
    }
}

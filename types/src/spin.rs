use chrono::{DateTime, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One labelled wheel segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSegment {
    pub label: String,
    pub multiplier: Decimal,
    pub probability: f64,
}

impl OutcomeSegment {
    pub fn new(label: impl Into<String>, multiplier: Decimal, probability: f64) -> Self {
        Self {
            label: label.into(),
            multiplier,
            probability,
        }
    }
}

/// Optional schedule for automatic activation.
///
/// A window with neither a time range nor any days never matches; such configurations are only
/// ever activated manually.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days_of_week: Vec<Weekday>,
}

impl ActivationWindow {
    pub fn is_scheduled(&self) -> bool {
        self.time_range().is_some() || !self.days_of_week.is_empty()
    }

    /// Both endpoints, when fully specified.
    pub fn time_range(&self) -> Option<(NaiveTime, NaiveTime)> {
        Some((self.start_time?, self.end_time?))
    }
}

/// Operator-managed selection of a registered algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmConfiguration {
    /// Unique operator-facing name.
    pub name: String,
    /// Registry key of the distribution this configuration selects.
    pub key: String,
    pub is_active: bool,
    #[serde(flatten)]
    pub window: ActivationWindow,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AlgorithmConfiguration {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            is_active: false,
            window: ActivationWindow::default(),
            description: description.into(),
            activated_at: None,
            created_at,
        }
    }

    pub fn with_window(mut self, window: ActivationWindow) -> Self {
        self.window = window;
        self
    }
}

/// Per-draw detail returned to the client. Not persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinDraw {
    pub label: String,
    pub multiplier: Decimal,
    pub cost: Decimal,
    pub payout: Decimal,
    pub net: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinSummary {
    pub total_spins: u32,
    pub total_cost: Decimal,
    pub total_payout: Decimal,
    pub net_result: Decimal,
    pub wins: u32,
    pub losses: u32,
    pub breaks_even: u32,
    /// Fraction of draws with payout above cost, in `[0, 1]`.
    pub win_rate: Decimal,
}

impl SpinSummary {
    /// `win_rate` as a display percentage, e.g. `60.0%`.
    pub fn win_rate_percent(&self) -> String {
        format!("{:.1}%", self.win_rate * Decimal::ONE_HUNDRED)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinBatchResult {
    pub batch_id: Uuid,
    pub draws: Vec<SpinDraw>,
    pub summary: SpinSummary,
    pub balance_after: Decimal,
    /// Name of the configuration the batch resolved.
    pub algorithm_used: String,
    pub algorithm_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_unscheduled_window() {
        let window = ActivationWindow::default();
        assert!(!window.is_scheduled());
        assert!(window.time_range().is_none());
    }

    #[test]
    fn test_half_open_time_range_is_not_a_range() {
        let window = ActivationWindow {
            start_time: NaiveTime::from_hms_opt(9, 0, 0),
            end_time: None,
            days_of_week: vec![],
        };
        assert!(window.time_range().is_none());
        assert!(!window.is_scheduled());
    }

    #[test]
    fn test_win_rate_percent() {
        let summary = SpinSummary {
            win_rate: dec!(0.6),
            ..Default::default()
        };
        assert_eq!(summary.win_rate_percent(), "60.0%");
    }

    #[test]
    fn test_configuration_flattens_window() {
        let config = AlgorithmConfiguration::new("Peak", "peak_hour", "", Utc::now()).with_window(
            ActivationWindow {
                start_time: NaiveTime::from_hms_opt(17, 0, 0),
                end_time: NaiveTime::from_hms_opt(21, 0, 0),
                days_of_week: vec![Weekday::Fri],
            },
        );
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["start_time"], "17:00:00");
        assert_eq!(json["days_of_week"][0], "Fri");
    }
}

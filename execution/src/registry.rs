use rust_decimal::Decimal;
use serde::Serialize;
use spinwallet_types::{OutcomeSegment, WalletError};
use std::sync::Arc;

use crate::distribution::Distribution;

/// Display metadata for a registered algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AlgorithmInfo {
    pub key: String,
    pub name: String,
    pub description: String,
}

impl AlgorithmInfo {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Wheel labels and multipliers shared by every built-in algorithm, in wheel order.
const WHEEL: [(&str, Decimal); 8] = [
    ("2x", Decimal::from_parts(2, 0, 0, false, 0)),
    ("0.5x", Decimal::from_parts(5, 0, 0, false, 1)),
    ("3x", Decimal::from_parts(3, 0, 0, false, 0)),
    ("LOSE", Decimal::ZERO),
    ("1.5x", Decimal::from_parts(15, 0, 0, false, 1)),
    ("5x", Decimal::from_parts(5, 0, 0, false, 0)),
    ("1x", Decimal::ONE),
    ("2.5x", Decimal::from_parts(25, 0, 0, false, 1)),
];

/// `(key, name, description, probabilities in wheel order)`.
const BUILTIN: [(&str, &str, &str, [f64; 8]); 6] = [
    (
        "balanced",
        "Balanced",
        "Equal probability distribution - good for peak hours",
        [0.125; 8],
    ),
    (
        "conservative",
        "Conservative",
        "Lower probability for big wins - suitable for low-traffic hours",
        [0.18, 0.28, 0.06, 0.28, 0.10, 0.03, 0.04, 0.03],
    ),
    (
        "generous",
        "Generous",
        "Higher win probability - good for promotions and weekends",
        [0.15, 0.15, 0.12, 0.15, 0.18, 0.08, 0.10, 0.07],
    ),
    (
        "peak_hour",
        "Peak Hour",
        "Optimized for high-traffic periods with frequent small wins",
        [0.20, 0.15, 0.08, 0.18, 0.22, 0.04, 0.08, 0.05],
    ),
    (
        "late_night",
        "Late Night",
        "Conservative late-night algorithm for sustained engagement",
        [0.16, 0.30, 0.04, 0.30, 0.12, 0.02, 0.04, 0.02],
    ),
    (
        "aggressive_losing_streak",
        "Aggressive Losing Streak",
        "High loss probability for stress testing and edge case handling",
        [0.05, 0.45, 0.01, 0.40, 0.05, 0.01, 0.02, 0.01],
    ),
];

/// Registered distributions keyed by algorithm key, in registration order.
///
/// Built once at startup and shared read-only; distributions are handed out as `Arc`s so a spin
/// keeps the one it resolved even if the active configuration changes mid-batch.
#[derive(Clone, Debug, Default)]
pub struct AlgorithmRegistry {
    entries: Vec<(AlgorithmInfo, Arc<Distribution>)>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the six built-in wheel algorithms.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for (key, name, description, probabilities) in BUILTIN {
            let segments = WHEEL
                .iter()
                .zip(probabilities)
                .map(|((label, multiplier), p)| OutcomeSegment::new(*label, *multiplier, p))
                .collect();
            // Static tables above all sum to one.
            if let Err(err) = registry.register(AlgorithmInfo::new(key, name, description), segments)
            {
                tracing::error!(key, ?err, "built-in algorithm rejected");
            }
        }
        registry
    }

    /// Validate and register `segments` under `info.key`.
    pub fn register(
        &mut self,
        info: AlgorithmInfo,
        segments: Vec<OutcomeSegment>,
    ) -> Result<(), WalletError> {
        if self.entries.iter().any(|(existing, _)| existing.key == info.key) {
            return Err(WalletError::InvalidDistribution {
                key: info.key,
                reason: "key already registered".to_string(),
            });
        }
        let distribution =
            Distribution::new(segments).map_err(|err| WalletError::InvalidDistribution {
                key: info.key.clone(),
                reason: err.to_string(),
            })?;
        self.entries.push((info, Arc::new(distribution)));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Arc<Distribution>, WalletError> {
        self.entries
            .iter()
            .find(|(info, _)| info.key == key)
            .map(|(_, distribution)| distribution.clone())
            .ok_or_else(|| WalletError::UnknownAlgorithm {
                key: key.to_string(),
            })
    }

    pub fn info(&self, key: &str) -> Option<&AlgorithmInfo> {
        self.entries
            .iter()
            .find(|(info, _)| info.key == key)
            .map(|(info, _)| info)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.info(key).is_some()
    }

    /// Registered algorithms in registration order.
    pub fn available(&self) -> Vec<AlgorithmInfo> {
        self.entries.iter().map(|(info, _)| info.clone()).collect()
    }
}

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use spinwallet_types::OutcomeSegment;
use thiserror::Error as ThisError;

use crate::rng::RandomSource;

/// Allowed deviation of the probability sum from 1.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, ThisError, PartialEq)]
pub enum DistributionError {
    #[error("distribution has no segments")]
    Empty,
    #[error("segment {label} has invalid probability {probability}")]
    InvalidProbability { label: String, probability: f64 },
    #[error("segment {label} has negative multiplier {multiplier}")]
    NegativeMultiplier { label: String, multiplier: Decimal },
    #[error("probabilities sum to {sum}, expected 1")]
    InvalidSum { sum: f64 },
}

/// Immutable weighted set of wheel segments.
///
/// Segment order is significant: draws walk the cumulative probability in declared order.
#[derive(Clone, Debug, PartialEq)]
pub struct Distribution {
    segments: Vec<OutcomeSegment>,
    /// Last declared segment, returned when a roll lands past the accumulated total.
    fallback: OutcomeSegment,
}

impl Distribution {
    pub fn new(segments: Vec<OutcomeSegment>) -> Result<Self, DistributionError> {
        let Some(fallback) = segments.last().cloned() else {
            return Err(DistributionError::Empty);
        };
        for segment in &segments {
            let p = segment.probability;
            if !p.is_finite() || p <= 0.0 || p > 1.0 {
                return Err(DistributionError::InvalidProbability {
                    label: segment.label.clone(),
                    probability: p,
                });
            }
            if segment.multiplier.is_sign_negative() && !segment.multiplier.is_zero() {
                return Err(DistributionError::NegativeMultiplier {
                    label: segment.label.clone(),
                    multiplier: segment.multiplier,
                });
            }
        }
        let sum: f64 = segments.iter().map(|s| s.probability).sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(DistributionError::InvalidSum { sum });
        }
        Ok(Self { segments, fallback })
    }

    pub fn segments(&self) -> &[OutcomeSegment] {
        &self.segments
    }

    pub fn draw(&self, source: &mut impl RandomSource) -> &OutcomeSegment {
        self.select(source.next_unit())
    }

    /// Segment for a roll in `[0, 1)`. Falls back to the last segment when rounding leaves the
    /// roll above the accumulated total.
    pub fn select(&self, roll: f64) -> &OutcomeSegment {
        let mut cumulative = 0.0;
        for segment in &self.segments {
            cumulative += segment.probability;
            if roll <= cumulative {
                return segment;
            }
        }
        &self.fallback
    }

    /// Expected payout per unit wagered.
    pub fn expected_return(&self) -> f64 {
        self.segments
            .iter()
            .map(|s| s.probability * s.multiplier.to_f64().unwrap_or(0.0))
            .sum()
    }
}

use rust_decimal::{Decimal, RoundingStrategy};
use spinwallet_types::{
    api::SpinRequest,
    money::{checked_add, checked_mul, checked_sub, round_money, validate_amount},
    SpinBatchResult, SpinDraw, SpinSummary, UserId, WalletError, SOURCE_SPIN_PAYOUT,
    SOURCE_SPIN_WAGER,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::configuration::Configurations;
use crate::distribution::Distribution;
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::rng::{RandomSource, RngSource};
use crate::state::State;

/// Fractional digits kept in a reported win rate.
const WIN_RATE_SCALE: u32 = 4;

/// Draw `count` outcomes and price each at `unit_cost`.
///
/// Pure: no storage access, no suspension. Payouts are truncated to the money scale per draw so
/// a batch prices exactly like the same draws taken one at a time. A payout too large for a
/// `Decimal` fails the whole batch with `InvalidAmount`.
pub fn play(
    distribution: &Distribution,
    unit_cost: Decimal,
    count: u32,
    source: &mut impl RandomSource,
) -> Result<Vec<SpinDraw>, WalletError> {
    (0..count)
        .map(|_| -> Result<SpinDraw, WalletError> {
            let segment = distribution.draw(&mut *source);
            let payout = round_money(checked_mul(unit_cost, segment.multiplier)?);
            Ok(SpinDraw {
                label: segment.label.clone(),
                multiplier: segment.multiplier,
                cost: unit_cost,
                payout,
                net: checked_sub(payout, unit_cost)?,
            })
        })
        .collect()
}

pub fn summarize(draws: &[SpinDraw]) -> Result<SpinSummary, WalletError> {
    let mut summary = SpinSummary {
        total_spins: draws.len() as u32,
        ..Default::default()
    };
    for draw in draws {
        summary.total_cost = checked_add(summary.total_cost, draw.cost)?;
        summary.total_payout = checked_add(summary.total_payout, draw.payout)?;
        match draw.payout.cmp(&draw.cost) {
            std::cmp::Ordering::Greater => summary.wins += 1,
            std::cmp::Ordering::Less => summary.losses += 1,
            std::cmp::Ordering::Equal => summary.breaks_even += 1,
        }
    }
    summary.net_result = checked_sub(summary.total_payout, summary.total_cost)?;
    if summary.total_spins > 0 {
        summary.win_rate = (Decimal::from(summary.wins) / Decimal::from(summary.total_spins))
            .round_dp_with_strategy(WIN_RATE_SCALE, RoundingStrategy::MidpointNearestEven);
    }
    Ok(summary)
}

/// Runs spin batches against the active configuration.
pub struct SpinEngine<S: State> {
    ledger: Ledger<S>,
    configurations: Configurations<S>,
    max_spins: u32,
}

impl<S: State> Clone for SpinEngine<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            configurations: self.configurations.clone(),
            max_spins: self.max_spins,
        }
    }
}

impl<S: State> SpinEngine<S> {
    pub fn new(ledger: Ledger<S>, configurations: Configurations<S>, max_spins: u32) -> Self {
        Self {
            ledger,
            configurations,
            max_spins,
        }
    }

    pub fn max_spins(&self) -> u32 {
        self.max_spins
    }

    pub async fn spin(
        &self,
        user: UserId,
        request: &SpinRequest,
    ) -> Result<SpinBatchResult, EngineError> {
        let mut source = RngSource::from_entropy();
        self.spin_with(user, request, &mut source).await
    }

    /// Run one batch drawing from `source`.
    ///
    /// Rejections (count, amount, configuration, funds) all happen before the single commit, so a
    /// failed batch moves no money.
    pub async fn spin_with<R: RandomSource + Send>(
        &self,
        user: UserId,
        request: &SpinRequest,
        source: &mut R,
    ) -> Result<SpinBatchResult, EngineError> {
        let count = request.count;
        if count == 0 || count > self.max_spins {
            warn!(%user, count, max = self.max_spins, "spin count rejected");
            return Err(WalletError::InvalidCount {
                count,
                max: self.max_spins,
            }
            .into());
        }
        let unit_cost = validate_amount(request.unit_cost)?;

        let (configuration, distribution) = match self.configurations.resolve_active().await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(%user, %err, "spin refused: no usable configuration");
                return Err(err);
            }
        };

        let total_cost =
            match checked_mul(unit_cost, Decimal::from(count)).and_then(validate_amount) {
                Ok(total_cost) => total_cost,
                Err(err) => {
                    warn!(%user, %unit_cost, count, "spin batch cost out of range");
                    return Err(err.into());
                }
            };

        let batch_id = Uuid::new_v4();
        let (draws, summary) = match play(&distribution, unit_cost, count, source)
            .and_then(|draws| summarize(&draws).map(|summary| (draws, summary)))
        {
            Ok(priced) => priced,
            Err(err) => {
                warn!(
                    %user,
                    algorithm = %configuration.key,
                    %err,
                    "spin batch payout out of range"
                );
                return Err(err.into());
            }
        };
        debug_assert_eq!(total_cost, summary.total_cost);

        let notes = format!(
            "batch {batch_id}: {count} x {unit_cost} on {}",
            configuration.name
        );
        let receipt = self
            .ledger
            .apply_atomic(
                user,
                total_cost,
                summary.total_payout,
                (SOURCE_SPIN_WAGER, SOURCE_SPIN_PAYOUT),
                &notes,
            )
            .await?;

        info!(
            %user,
            batch = %batch_id,
            algorithm = %configuration.key,
            count,
            total_cost = %summary.total_cost,
            total_payout = %summary.total_payout,
            balance = %receipt.wallet.balance,
            "spin batch committed"
        );
        Ok(SpinBatchResult {
            batch_id,
            draws,
            summary,
            balance_after: receipt.wallet.balance,
            algorithm_used: configuration.name,
            algorithm_key: configuration.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ScriptedSource;
    use rust_decimal_macros::dec;
    use spinwallet_types::OutcomeSegment;

    fn wheel() -> Distribution {
        Distribution::new(vec![
            OutcomeSegment::new("2x", dec!(2), 0.25),
            OutcomeSegment::new("1x", dec!(1), 0.25),
            OutcomeSegment::new("0.5x", dec!(0.5), 0.25),
            OutcomeSegment::new("LOSE", dec!(0), 0.25),
        ])
        .unwrap()
    }

    #[test]
    fn test_play_prices_each_draw() {
        let mut source = ScriptedSource::new(vec![0.1, 0.3, 0.6, 0.9]);
        let draws = play(&wheel(), dec!(20), 4, &mut source).unwrap();
        let payouts: Vec<_> = draws.iter().map(|d| d.payout).collect();
        assert_eq!(payouts, vec![dec!(40), dec!(20), dec!(10), dec!(0)]);
        assert_eq!(draws[3].net, dec!(-20));
    }

    #[test]
    fn test_summary_counts_wins_losses_and_breaks_even() {
        let mut source = ScriptedSource::new(vec![0.1, 0.3, 0.6, 0.9]);
        let summary = summarize(&play(&wheel(), dec!(20), 4, &mut source).unwrap()).unwrap();
        assert_eq!(summary.total_spins, 4);
        assert_eq!(summary.total_cost, dec!(80));
        assert_eq!(summary.total_payout, dec!(70));
        assert_eq!(summary.net_result, dec!(-10));
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.breaks_even, 1);
        assert_eq!(summary.losses, 2);
        assert_eq!(summary.win_rate, dec!(0.25));
    }

    #[test]
    fn test_sub_cent_payouts_truncate_per_draw() {
        let distribution =
            Distribution::new(vec![OutcomeSegment::new("0.5x", dec!(0.5), 1.0)]).unwrap();
        let mut source = ScriptedSource::new(vec![0.5]);
        let draws = play(&distribution, dec!(0.05), 3, &mut source).unwrap();
        assert!(draws.iter().all(|d| d.payout == dec!(0.02)));
        assert_eq!(summarize(&draws).unwrap().total_payout, dec!(0.06));
    }

    #[test]
    fn test_win_rate_rounds_to_four_places() {
        let mut source = ScriptedSource::new(vec![0.1, 0.9, 0.9]);
        let summary = summarize(&play(&wheel(), dec!(1), 3, &mut source).unwrap()).unwrap();
        assert_eq!(summary.win_rate, dec!(0.3333));
    }

    #[test]
    fn test_play_reports_payout_overflow() {
        let distribution =
            Distribution::new(vec![OutcomeSegment::new("jackpot", Decimal::MAX, 1.0)]).unwrap();
        let mut source = ScriptedSource::new(vec![0.5]);
        assert_eq!(
            play(&distribution, dec!(2), 1, &mut source),
            Err(WalletError::InvalidAmount { amount: dec!(2) })
        );
    }

    #[test]
    fn test_summary_reports_total_overflow() {
        let draw = SpinDraw {
            label: "jackpot".into(),
            multiplier: dec!(1),
            cost: dec!(1),
            payout: Decimal::MAX,
            net: Decimal::MAX - dec!(1),
        };
        assert_eq!(
            summarize(&[draw.clone(), draw]),
            Err(WalletError::InvalidAmount {
                amount: Decimal::MAX
            })
        );
    }

    #[test]
    fn test_empty_summary() {
        let summary = summarize(&[]).unwrap();
        assert_eq!(summary.win_rate, Decimal::ZERO);
        assert_eq!(summary.total_spins, 0);
    }
}

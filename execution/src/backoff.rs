use rand::{Rng, RngCore};
use std::time::Duration;

/// Upper bound on any single retry delay.
const MAX_BACKOFF: Duration = Duration::from_millis(250);

pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    // "Equal jitter": delay is in [backoff/2, backoff].
    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Delay before retry number `attempt` (1-based): `base` doubled per attempt, capped, jittered.
pub(crate) fn retry_delay(rng: &mut impl RngCore, base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF);
    jittered_backoff(rng, scaled)
}

//! Background duties of the daemon: the activation scheduler and the payment expiry sweep.

use chrono::{Local, Utc};
use spinwallet_execution::{Engine, EngineError, State};
use std::{future::Future, time::Duration};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

pub struct Service<S: State> {
    engine: Engine<S>,
    scheduler_interval: Duration,
    sweep_interval: Duration,
}

impl<S: State> Service<S> {
    pub fn new(engine: Engine<S>, scheduler_interval: Duration, sweep_interval: Duration) -> Self {
        Self {
            engine,
            scheduler_interval,
            sweep_interval,
        }
    }

    /// Evaluate activation windows against local wall-clock time.
    pub async fn tick_scheduler(&self) -> Result<(), EngineError> {
        let local_now = Local::now().naive_local();
        if let Some(activated) = self.engine.configurations.tick(local_now, Utc::now()).await? {
            info!(name = %activated.name, key = %activated.key, "scheduled configuration activated");
        }
        Ok(())
    }

    /// Expire stale payment requests. Returns how many were expired.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let expired = self.engine.payments.sweep_expired(Utc::now()).await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale payment requests");
        }
        Ok(expired.len())
    }

    /// Run both duties until `shutdown` resolves. Failures are logged and retried next tick.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut scheduler = interval(self.scheduler_interval);
        scheduler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeper = interval(self.sweep_interval);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            scheduler_secs = self.scheduler_interval.as_secs(),
            sweep_secs = self.sweep_interval.as_secs(),
            "wallet service online"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("wallet service shutting down");
                    return;
                }
                _ = scheduler.tick() => {
                    if let Err(err) = self.tick_scheduler().await {
                        warn!(%err, "scheduler tick failed");
                    }
                }
                _ = sweeper.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(%err, "payment sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use spinwallet_execution::{mocks, EngineConfig, Memory, PaymentConfig};
    use spinwallet_types::{PaymentStatus, UserId};

    #[tokio::test]
    async fn test_service_expires_and_stops() {
        let config = EngineConfig {
            payments: PaymentConfig {
                expiry: Duration::from_millis(10),
                ..Default::default()
            },
            ..mocks::create_config()
        };
        let (engine, _) = mocks::create_engine_with(Memory::default(), config);
        let provider = mocks::MockProvider::acknowledging();
        let request = engine
            .payments
            .initiate(&provider, UserId(1), dec!(100), "0712345678")
            .await
            .unwrap();
        let reference = request.checkout_reference.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let service = Service::new(
            engine.clone(),
            Duration::from_secs(60),
            Duration::from_millis(5),
        );
        service
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        let record = engine.payments.status_of(&reference).await.unwrap();
        assert_eq!(record.status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn test_scheduler_tick_without_windows_keeps_manual_choice() {
        let (engine, _) = mocks::create_engine(mocks::COIN_FLIP).await;
        let service = Service::new(
            engine.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        service.tick_scheduler().await.unwrap();
        assert_eq!(
            engine.configurations.active().await.unwrap().key,
            mocks::COIN_FLIP
        );
        assert_eq!(service.sweep().await.unwrap(), 0);
    }
}

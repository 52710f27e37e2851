use crate::{
    registry::{AlgorithmInfo, AlgorithmRegistry},
    rng::RandomSource,
    Engine, EngineConfig, LedgerConfig, Memory, PaymentProvider, ProviderAck, ProviderError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use spinwallet_types::{AlgorithmConfiguration, OutcomeSegment, PaymentRequest, UserId};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Key of the 50/50 double-or-nothing distribution registered by [`create_registry`].
pub const COIN_FLIP: &str = "coin_flip";
/// Key of the always-lose distribution registered by [`create_registry`].
pub const ALL_LOSE: &str = "all_lose";

/// Replays a fixed sequence of rolls, cycling when exhausted.
pub struct ScriptedSource {
    rolls: Vec<f64>,
    next: usize,
}

impl ScriptedSource {
    pub fn new(rolls: Vec<f64>) -> Self {
        assert!(!rolls.is_empty(), "scripted source needs at least one roll");
        Self { rolls, next: 0 }
    }

    /// Rolls landing on the `2x` and `LOSE` halves of [`COIN_FLIP`] in the given order.
    pub fn coin(wins: &[bool]) -> Self {
        Self::new(
            wins.iter()
                .map(|win| if *win { 0.25 } else { 0.75 })
                .collect(),
        )
    }
}

impl RandomSource for ScriptedSource {
    fn next_unit(&mut self) -> f64 {
        let roll = self.rolls[self.next % self.rolls.len()];
        self.next += 1;
        roll
    }
}

/// How [`MockProvider`] answers push requests.
#[derive(Clone, Debug)]
pub enum ProviderMode {
    Acknowledge,
    Reject(String),
    /// Sleep this long before acknowledging.
    Delay(Duration),
    /// Acknowledge every request with this same reference.
    Fixed(String),
}

/// Scripted payment provider issuing `ws_CO_<n>` checkout references.
pub struct MockProvider {
    mode: ProviderMode,
    issued: AtomicU64,
}

impl MockProvider {
    pub fn new(mode: ProviderMode) -> Self {
        Self {
            mode,
            issued: AtomicU64::new(0),
        }
    }

    pub fn acknowledging() -> Self {
        Self::new(ProviderMode::Acknowledge)
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

impl PaymentProvider for MockProvider {
    fn request_payment(
        &self,
        _request: &PaymentRequest,
    ) -> impl Future<Output = Result<ProviderAck, ProviderError>> + Send {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = self.mode.clone();
        async move {
            let checkout_reference = match mode {
                ProviderMode::Acknowledge => format!("ws_CO_{n}"),
                ProviderMode::Reject(reason) => return Err(ProviderError::Rejected(reason)),
                ProviderMode::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    format!("ws_CO_{n}")
                }
                ProviderMode::Fixed(reference) => reference,
            };
            Ok(ProviderAck {
                checkout_reference,
                message: "Success. Request accepted for processing".to_string(),
            })
        }
    }
}

/// Creates a registry with the built-in algorithms plus [`COIN_FLIP`] and [`ALL_LOSE`]
pub fn create_registry() -> AlgorithmRegistry {
    let mut registry = AlgorithmRegistry::builtin();
    let coin = vec![
        OutcomeSegment::new("2x", Decimal::TWO, 0.5),
        OutcomeSegment::new("LOSE", Decimal::ZERO, 0.5),
    ];
    let lose = vec![OutcomeSegment::new("LOSE", Decimal::ZERO, 1.0)];
    for (info, segments) in [
        (AlgorithmInfo::new(COIN_FLIP, "Coin Flip", "double or nothing"), coin),
        (AlgorithmInfo::new(ALL_LOSE, "All Lose", "every draw loses"), lose),
    ] {
        if let Err(err) = registry.register(info, segments) {
            panic!("test distribution rejected: {err}");
        }
    }
    registry
}

/// Test configuration with short retry delays
pub fn create_config() -> EngineConfig {
    EngineConfig {
        ledger: LedgerConfig {
            max_attempts: 64,
            backoff: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

/// Creates an engine over fresh in-memory state with no configuration
pub fn create_engine_with(state: Memory, config: EngineConfig) -> (Engine<Memory>, Arc<Memory>) {
    let state = Arc::new(state);
    let engine = Engine::new(state.clone(), Arc::new(create_registry()), config);
    (engine, state)
}

/// Creates an engine whose only configuration, active, selects `key`
pub async fn create_engine(key: &str) -> (Engine<Memory>, Arc<Memory>) {
    let (engine, state) = create_engine_with(Memory::default(), create_config());
    activate(&engine, key).await;
    (engine, state)
}

/// Creates and activates a configuration named after `key`
pub async fn activate(engine: &Engine<Memory>, key: &str) {
    engine
        .configurations
        .create(AlgorithmConfiguration::new(key, key, "", Utc::now()))
        .await
        .unwrap_or_else(|err| panic!("create {key}: {err}"));
    engine
        .configurations
        .activate(key, Utc::now())
        .await
        .unwrap_or_else(|err| panic!("activate {key}: {err}"));
}

/// Credits `amount` to `user` through an external deposit with a unique reference
pub async fn fund(engine: &Engine<Memory>, user: UserId, amount: Decimal) {
    let reference = format!("fund-{}", uuid::Uuid::new_v4());
    engine
        .ledger
        .deposit(user, amount, &reference, "test funding")
        .await
        .unwrap_or_else(|err| panic!("fund {user}: {err}"));
}

//! Spinwallet execution layer.
//!
//! This crate holds the transactional core: the per-user [`Ledger`], the append-only
//! [`TransactionLog`], outcome [`Distribution`]s and their [`AlgorithmRegistry`], the
//! [`SpinEngine`], and the [`PaymentReconciler`].
//!
//! ## Storage invariants
//! All writes go through [`State::apply`], which commits a batch of [`Change`]s atomically or not
//! at all. Wallet rows are compare-and-swapped on their version, payment requests on their status,
//! and log rows carrying an external reference are unique per `(wallet, reference, kind)`. The
//! ledger relies on these to stay race-free without holding locks across suspension points.
//!
//! ## Minimal spin (example)
//! ```rust,ignore
//! use std::sync::Arc;
//! use spinwallet_execution::{AlgorithmRegistry, Engine, EngineConfig};
//! use spinwallet_types::{api::SpinRequest, UserId};
//!
//! # async fn example<S: spinwallet_execution::State>(state: Arc<S>) -> anyhow::Result<()> {
//! let engine = Engine::new(state, Arc::new(AlgorithmRegistry::builtin()), EngineConfig::default());
//! engine.configurations.seed_defaults(chrono::Utc::now()).await?;
//! let result = engine.spins.spin(UserId(1), &SpinRequest::default()).await?;
//! println!("balance after: {}", result.balance_after);
//! # Ok(())
//! # }
//! ```

pub mod configuration;
pub mod distribution;
pub mod ledger;
pub mod payments;
pub mod registry;
pub mod rng;
pub mod schedule;
pub mod spin;
pub mod transaction_log;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod idempotency_tests;

mod backoff;
mod engine;
mod error;
mod layer;
mod state;

pub use configuration::Configurations;
pub use distribution::{Distribution, DistributionError, PROBABILITY_TOLERANCE};
pub use engine::{Engine, EngineConfig};
pub use error::{CommitError, EngineError};
pub use layer::Layer;
pub use ledger::{AtomicReceipt, AuditReport, Ledger, LedgerConfig};
pub use payments::{
    normalize_phone, PaymentConfig, PaymentProvider, PaymentReconciler, ProviderAck,
    ProviderError, Reconciliation,
};
pub use registry::{AlgorithmInfo, AlgorithmRegistry};
pub use rng::{RandomSource, RngSource};
pub use spin::SpinEngine;
#[cfg(any(test, feature = "mocks"))]
pub use state::Memory;
pub use state::{Change, State, TransactionFilter, DEFAULT_HISTORY_LIMIT};
pub use transaction_log::{TransactionLog, WalletWrite};

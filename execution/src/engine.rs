use std::sync::Arc;

use spinwallet_types::api::DEFAULT_MAX_SPINS;

use crate::configuration::Configurations;
use crate::ledger::{Ledger, LedgerConfig};
use crate::payments::{PaymentConfig, PaymentReconciler};
use crate::registry::AlgorithmRegistry;
use crate::spin::SpinEngine;
use crate::state::State;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_spins: u32,
    pub ledger: LedgerConfig,
    pub payments: PaymentConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_spins: DEFAULT_MAX_SPINS,
            ledger: LedgerConfig::default(),
            payments: PaymentConfig::default(),
        }
    }
}

/// Every component wired over one shared [`State`].
pub struct Engine<S: State> {
    pub ledger: Ledger<S>,
    pub configurations: Configurations<S>,
    pub spins: SpinEngine<S>,
    pub payments: PaymentReconciler<S>,
}

impl<S: State> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            configurations: self.configurations.clone(),
            spins: self.spins.clone(),
            payments: self.payments.clone(),
        }
    }
}

impl<S: State> Engine<S> {
    pub fn new(state: Arc<S>, registry: Arc<AlgorithmRegistry>, config: EngineConfig) -> Self {
        let ledger = Ledger::new(state.clone(), config.ledger);
        let configurations = Configurations::new(state.clone(), registry);
        let spins = SpinEngine::new(ledger.clone(), configurations.clone(), config.max_spins);
        let payments = PaymentReconciler::new(state, ledger.clone(), config.payments);
        Self {
            ledger,
            configurations,
            spins,
            payments,
        }
    }
}

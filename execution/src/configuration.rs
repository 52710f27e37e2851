use chrono::{DateTime, NaiveDateTime, Utc};
use spinwallet_types::{AlgorithmConfiguration, WalletError};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::distribution::Distribution;
use crate::error::{CommitError, EngineError};
use crate::layer::Layer;
use crate::registry::AlgorithmRegistry;
use crate::schedule;
use crate::state::{Change, State};

/// Operator-facing view over stored algorithm configurations.
pub struct Configurations<S: State> {
    state: Arc<S>,
    registry: Arc<AlgorithmRegistry>,
}

impl<S: State> Clone for Configurations<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S: State> Configurations<S> {
    pub fn new(state: Arc<S>, registry: Arc<AlgorithmRegistry>) -> Self {
        Self { state, registry }
    }

    pub fn registry(&self) -> &AlgorithmRegistry {
        &self.registry
    }

    /// Create or update a configuration. Its activation state is left unchanged.
    pub async fn create(
        &self,
        configuration: AlgorithmConfiguration,
    ) -> Result<AlgorithmConfiguration, EngineError> {
        if !self.registry.contains(&configuration.key) {
            return Err(WalletError::UnknownAlgorithm {
                key: configuration.key,
            }
            .into());
        }
        let name = configuration.name.clone();
        let mut layer = Layer::new(self.state.as_ref());
        layer.put_configuration(configuration);
        layer.apply().await?;
        self.find(&name)
            .await?
            .ok_or_else(|| WalletError::ConfigurationNotFound { name }.into())
    }

    pub async fn find(&self, name: &str) -> Result<Option<AlgorithmConfiguration>, EngineError> {
        Ok(self
            .state
            .configurations()
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    pub async fn list(&self) -> Result<Vec<AlgorithmConfiguration>, EngineError> {
        Ok(self.state.configurations().await?)
    }

    /// Make `name` the only active configuration.
    pub async fn activate(
        &self,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<AlgorithmConfiguration, EngineError> {
        let change = Change::Activate {
            name: name.to_string(),
            at,
        };
        match self.state.apply(vec![change]).await {
            Ok(()) => {}
            Err(CommitError::MissingConfiguration { name }) => {
                warn!(%name, "activation of unknown configuration");
                return Err(WalletError::ConfigurationNotFound { name }.into());
            }
            Err(err) => return Err(err.into()),
        }
        info!(name, "algorithm configuration activated");
        self.find(name)
            .await?
            .ok_or_else(|| WalletError::ConfigurationNotFound { name: name.into() }.into())
    }

    pub async fn deactivate_all(&self) -> Result<(), EngineError> {
        self.state.apply(vec![Change::DeactivateAll]).await?;
        info!("all algorithm configurations deactivated");
        Ok(())
    }

    pub async fn active(&self) -> Result<AlgorithmConfiguration, EngineError> {
        self.state
            .configurations()
            .await?
            .into_iter()
            .find(|c| c.is_active)
            .ok_or_else(|| WalletError::Unconfigured.into())
    }

    /// Active configuration and its distribution, as one snapshot.
    pub async fn resolve_active(
        &self,
    ) -> Result<(AlgorithmConfiguration, Arc<Distribution>), EngineError> {
        let configuration = self.active().await?;
        let distribution = self.registry.get(&configuration.key)?;
        Ok((configuration, distribution))
    }

    /// Activate the configuration whose window best covers `local_now`.
    ///
    /// Writes only when the best match is not already active. A manual activation therefore
    /// lasts until the next tick that finds a matching window, and indefinitely when none
    /// matches. Returns the newly activated configuration.
    pub async fn tick(
        &self,
        local_now: NaiveDateTime,
        at: DateTime<Utc>,
    ) -> Result<Option<AlgorithmConfiguration>, EngineError> {
        let configurations = self.state.configurations().await?;
        let Some(best) = schedule::best_match(&configurations, local_now) else {
            debug!(%local_now, "no scheduled configuration matches");
            return Ok(None);
        };
        if best.is_active {
            return Ok(None);
        }
        let name = best.name.clone();
        info!(%name, %local_now, "scheduler switching configuration");
        self.activate(&name, at).await.map(Some)
    }

    /// Create a `"<Name> - Default"` configuration for every registered algorithm and activate
    /// the first one if nothing is active yet. Safe to run repeatedly.
    pub async fn seed_defaults(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlgorithmConfiguration>, EngineError> {
        let existing = self.state.configurations().await?;
        let mut layer = Layer::new(self.state.as_ref());
        let mut created = Vec::new();
        for info in self.registry.available() {
            let name = format!("{} - Default", info.name);
            if existing.iter().any(|c| c.name == name) {
                continue;
            }
            let configuration =
                AlgorithmConfiguration::new(name, info.key.clone(), info.description.clone(), now);
            layer.put_configuration(configuration.clone());
            created.push(configuration);
        }
        layer.apply().await?;

        if !existing.iter().any(|c| c.is_active) {
            if let Some(first) = self.registry.available().first() {
                self.activate(&format!("{} - Default", first.name), now)
                    .await?;
            }
        }
        info!(created = created.len(), "default configurations seeded");
        Ok(created)
    }
}

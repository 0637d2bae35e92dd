//! Endpoint registry: holds the current endpoint set and publishes it as an
//! immutable snapshot.
//!
//! Readers take the snapshot once and keep it for the whole dispatch call, so
//! a mid-call reload can never split state between endpoints. Reload builds a
//! fresh `EndpointState` per enabled config and swaps the pointer atomically;
//! the old snapshot is dropped when the last in-flight dispatch releases it.

use super::state::{client_config, now_nanos, EndpointState};
use super::DispatchError;
use crate::clients::new_client;
use crate::storage::{ConfigStore, ProviderConfig};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::{info, warn};

pub type Snapshot = Arc<Vec<Arc<EndpointState>>>;

pub struct EndpointRegistry {
    store: Arc<dyn ConfigStore>,
    endpoints: ArcSwapOption<Vec<Arc<EndpointState>>>,
}

impl EndpointRegistry {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            endpoints: ArcSwapOption::empty(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Current snapshot, loading from the store on first use.
    pub async fn snapshot(&self) -> Result<Snapshot, DispatchError> {
        if let Some(endpoints) = self.endpoints.load_full() {
            return Ok(endpoints);
        }
        self.reload().await?;
        Ok(self
            .endpoints
            .load_full()
            .unwrap_or_else(|| Arc::new(Vec::new())))
    }

    /// Pull the full config list, rebuild runtime state for every enabled
    /// entry and publish atomically. Entries whose client cannot be built
    /// are skipped with a warning.
    pub async fn reload(&self) -> Result<(), DispatchError> {
        let configs = self.store.list_all().await?;
        let now = now_nanos();

        let mut endpoints = Vec::with_capacity(configs.len());
        for cfg in configs {
            if !cfg.enabled {
                continue;
            }
            match new_client(&client_config(&cfg)) {
                Ok(client) => endpoints.push(Arc::new(EndpointState::new(cfg, client, now))),
                Err(err) => warn!(
                    name = %cfg.name,
                    provider = %cfg.provider,
                    %err,
                    "skipping endpoint with unusable client config"
                ),
            }
        }

        if endpoints.is_empty() {
            warn!("no enabled LLM endpoints after reload");
        } else {
            info!(count = endpoints.len(), "LLM endpoints reloaded");
        }
        self.endpoints.store(Some(Arc::new(endpoints)));
        Ok(())
    }

    /// Effective configs with the API key masked for operator display.
    pub async fn list_configs(&self) -> Result<Vec<ProviderConfig>, DispatchError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.iter().map(|ep| ep.cfg.masked()).collect())
    }

    /// Validate, normalise and persist a full replacement config set. Does
    /// not reload; the admin surface triggers that explicitly.
    pub async fn replace_configs(
        &self,
        mut configs: Vec<ProviderConfig>,
    ) -> Result<(), DispatchError> {
        for cfg in &mut configs {
            normalize(cfg)?;
        }
        self.store.replace_all(configs).await?;
        Ok(())
    }
}

fn normalize(cfg: &mut ProviderConfig) -> Result<(), DispatchError> {
    if cfg.priority == 0 {
        cfg.priority = 100;
    }
    if cfg.timeout_seconds <= 0 {
        cfg.timeout_seconds = 30;
    }
    if cfg.cooldown_seconds <= 0 {
        cfg.cooldown_seconds = 30;
    }
    if cfg.weight <= 0 {
        cfg.weight = 100;
    }
    if cfg.name.is_empty() {
        cfg.name = cfg.provider.to_string();
    }
    if cfg.input_price_per_1k < 0.0 || cfg.output_price_per_1k < 0.0 {
        return Err(DispatchError::Validation(
            "price must not be negative".to_string(),
        ));
    }
    if cfg.input_price_per_1k > 100.0 || cfg.output_price_per_1k > 100.0 {
        return Err(DispatchError::Validation(
            "price looks wrong (>100 USD per 1k tokens)".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ProviderKind;
    use crate::storage::MemoryStore;

    fn mock_config(name: &str, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            provider: ProviderKind::Mock,
            enabled,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn snapshot_lazy_loads_and_elides_disabled() {
        let store = Arc::new(MemoryStore::new(vec![
            mock_config("on", true),
            mock_config("off", false),
        ]));
        let registry = EndpointRegistry::new(store);

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].cfg.name, "on");
    }

    #[tokio::test]
    async fn reload_publishes_fresh_state() {
        let store = Arc::new(MemoryStore::new(vec![mock_config("a", true)]));
        let registry = EndpointRegistry::new(store.clone());

        let before = registry.snapshot().await.unwrap();
        before[0].record_dispatch_failure("err", now_nanos());

        store
            .replace_all(vec![mock_config("a", true), mock_config("b", true)])
            .await
            .unwrap();
        registry.reload().await.unwrap();

        let after = registry.snapshot().await.unwrap();
        assert_eq!(after.len(), 2);
        // Fresh state: counters are zero again.
        assert_eq!(
            after[0]
                .stats
                .total_requests
                .load(std::sync::atomic::Ordering::Acquire),
            0
        );
        // The old snapshot is untouched by the reload.
        assert_eq!(
            before[0]
                .stats
                .total_requests
                .load(std::sync::atomic::Ordering::Acquire),
            1
        );
    }

    #[tokio::test]
    async fn replace_configs_applies_defaults() {
        let store = Arc::new(MemoryStore::default());
        let registry = EndpointRegistry::new(store.clone());

        registry
            .replace_configs(vec![ProviderConfig {
                provider: ProviderKind::Mock,
                name: String::new(),
                priority: 0,
                weight: -1,
                timeout_seconds: 0,
                cooldown_seconds: -5,
                ..Default::default()
            }])
            .await
            .unwrap();

        let stored = store.list_all().await.unwrap();
        assert_eq!(stored[0].name, "mock");
        assert_eq!(stored[0].priority, 100);
        assert_eq!(stored[0].weight, 100);
        assert_eq!(stored[0].timeout_seconds, 30);
        assert_eq!(stored[0].cooldown_seconds, 30);
    }

    #[tokio::test]
    async fn replace_configs_rejects_bad_prices_without_writing() {
        let store = Arc::new(MemoryStore::new(vec![mock_config("keep", true)]));
        let registry = EndpointRegistry::new(store.clone());

        let err = registry
            .replace_configs(vec![ProviderConfig {
                input_price_per_1k: -1.0,
                ..mock_config("bad", true)
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        let stored = store.list_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "keep");
    }

    #[tokio::test]
    async fn list_configs_masks_keys() {
        let mut cfg = mock_config("m", true);
        cfg.api_key = "sk-secret-9876".to_string();
        let registry = EndpointRegistry::new(Arc::new(MemoryStore::new(vec![cfg])));

        let configs = registry.list_configs().await.unwrap();
        assert_eq!(configs[0].api_key, "****9876");
    }
}

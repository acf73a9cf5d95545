//! Provider registry.
//!
//! Maps provider ids to adapters, wraps every call in that provider's
//! circuit breaker, and classifies failures for the retry machinery.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::ProviderError;
use crate::observability::metrics;
use crate::provider::adapter::{ProviderAdapter, ProviderRequest, ProviderResponse};
use crate::provider::breaker::{BreakerState, CircuitBreaker};
use crate::template::closest_id;

struct Registered {
    adapter: Arc<dyn ProviderAdapter>,
    breaker: Arc<CircuitBreaker>,
}

/// Registry of provider adapters keyed by id.
pub struct ProviderRegistry {
    providers: DashMap<String, Registered>,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
    breaker_cooldown_cap: Duration,
}

impl ProviderRegistry {
    /// Creates an empty registry with breaker settings from the engine
    /// config.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            providers: DashMap::new(),
            breaker_threshold: config.breaker_failure_threshold,
            breaker_cooldown: config.breaker_cooldown,
            breaker_cooldown_cap: config.breaker_cooldown_cap,
        }
    }

    /// Registers an adapter under its own name, replacing any previous
    /// adapter with that name.
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        let name = adapter.name().to_string();
        debug!(provider = %name, "provider registered");
        let breaker = Arc::new(CircuitBreaker::new(
            name.clone(),
            self.breaker_threshold,
            self.breaker_cooldown,
            self.breaker_cooldown_cap,
        ));
        self.providers.insert(name, Registered { adapter, breaker });
    }

    /// Registered provider ids.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    /// Whether an id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    /// Models supported by a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownProvider`] with a closest-match
    /// suggestion when the id is not registered.
    pub fn supported_models(&self, id: &str) -> Result<Vec<String>, ProviderError> {
        self.providers
            .get(id)
            .map(|e| e.adapter.supported_models())
            .ok_or_else(|| self.unknown(id))
    }

    /// Current breaker state for a provider, if registered.
    #[must_use]
    pub fn breaker_state(&self, id: &str) -> Option<BreakerState> {
        self.providers.get(id).map(|e| e.breaker.state())
    }

    /// Sends a prompt through the provider's circuit breaker.
    ///
    /// Breaker-class failures (transport, overload) are recorded; a
    /// 4xx does not count against the circuit.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::UnknownProvider`] for unregistered ids
    /// - [`ProviderError::CircuitOpen`] while the breaker is open
    /// - whatever the adapter itself returns
    pub async fn send_guarded(
        &self,
        id: &str,
        cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let (adapter, breaker) = {
            let entry = self.providers.get(id).ok_or_else(|| self.unknown(id))?;
            (Arc::clone(&entry.adapter), Arc::clone(&entry.breaker))
        };

        let state_before = breaker.state();
        if let Err(retry_after) = breaker.check() {
            return Err(ProviderError::CircuitOpen {
                provider: id.to_string(),
                retry_after,
            });
        }
        let state_after = breaker.state();
        if state_before != state_after {
            metrics::record_breaker_transition(id, state_after.as_str());
        }

        match adapter.send_prompt(cancel, request).await {
            Ok(response) => {
                breaker.record_success();
                if state_after != BreakerState::Closed {
                    metrics::record_breaker_transition(id, BreakerState::Closed.as_str());
                }
                Ok(response)
            }
            Err(error) => {
                if error.trips_breaker() {
                    breaker.record_failure();
                    let now = breaker.state();
                    if now != state_after {
                        metrics::record_breaker_transition(id, now.as_str());
                    }
                }
                Err(error)
            }
        }
    }

    fn unknown(&self, id: &str) -> ProviderError {
        let names = self.names();
        ProviderError::UnknownProvider {
            id: id.to_string(),
            suggestion: closest_id(id, names.iter().map(String::as_str)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::scripted::ScriptedAdapter;

    fn registry() -> ProviderRegistry {
        let config = EngineConfig {
            breaker_failure_threshold: 2,
            breaker_cooldown: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        ProviderRegistry::new(&config)
    }

    #[tokio::test]
    async fn test_unknown_provider_suggests() {
        let reg = registry();
        reg.register(Arc::new(ScriptedAdapter::always("openai", "ok")));

        let err = reg.supported_models("openia").unwrap_err();
        match err {
            ProviderError::UnknownProvider { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("openai"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_send_guarded_success() {
        let reg = registry();
        reg.register(Arc::new(ScriptedAdapter::always("stub", "PWNED")));

        let cancel = CancellationToken::new();
        let response = reg
            .send_guarded("stub", &cancel, ScriptedAdapter::request("hi"))
            .await
            .unwrap();
        assert_eq!(response.text, "PWNED");
        assert_eq!(reg.breaker_state("stub"), Some(BreakerState::Closed));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let reg = registry();
        let adapter = ScriptedAdapter::always_overloaded("flaky");
        reg.register(Arc::new(adapter));

        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let err = reg
                .send_guarded("flaky", &cancel, ScriptedAdapter::request("hi"))
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderError::Overloaded { .. }));
        }
        assert_eq!(reg.breaker_state("flaky"), Some(BreakerState::Open));

        // Fail-fast without reaching the adapter.
        let err = reg
            .send_guarded("flaky", &cancel, ScriptedAdapter::request("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_client_error_does_not_trip_breaker() {
        let reg = registry();
        reg.register(Arc::new(ScriptedAdapter::always_client_error("strict")));

        let cancel = CancellationToken::new();
        for _ in 0..5 {
            let err = reg
                .send_guarded("strict", &cancel, ScriptedAdapter::request("hi"))
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderError::ClientError { .. }));
        }
        assert_eq!(reg.breaker_state("strict"), Some(BreakerState::Closed));
    }
}

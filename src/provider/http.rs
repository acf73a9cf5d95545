//! Shared plumbing for HTTP-backed adapters.

use std::time::Duration;

use reqwest::Client;

use crate::error::ProviderError;

/// Configuration shared by the HTTP adapters.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Provider id this adapter registers under
    pub name: String,
    /// API key
    pub api_key: String,
    /// Base URL override (for proxies and compatible servers)
    pub base_url: Option<String>,
    /// Models advertised by `supported_models`
    pub models: Vec<String>,
    /// Per-request HTTP timeout
    pub timeout: Duration,
}

impl AdapterConfig {
    /// Minimal config with a provider name and key.
    #[must_use]
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: None,
            models: Vec::new(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the advertised models.
    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }
}

/// Builds an HTTP client with the adapter timeout applied.
pub(crate) fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Maps a non-success HTTP status onto the provider error taxonomy.
///
/// 429 and 5xx are overload (retryable, breaker-tripping); other 4xx
/// are client errors (terminal).
pub(crate) fn classify_status(status: u16, message: String) -> ProviderError {
    if status == 429 || status >= 500 {
        ProviderError::Overloaded { status, message }
    } else {
        ProviderError::ClientError { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_overload_statuses() {
        assert!(matches!(
            classify_status(429, String::new()),
            ProviderError::Overloaded { .. }
        ));
        assert!(matches!(
            classify_status(503, String::new()),
            ProviderError::Overloaded { .. }
        ));
    }

    #[test]
    fn test_classify_client_statuses() {
        assert!(matches!(
            classify_status(400, String::new()),
            ProviderError::ClientError { .. }
        ));
        assert!(matches!(
            classify_status(401, String::new()),
            ProviderError::ClientError { .. }
        ));
        assert!(matches!(
            classify_status(404, String::new()),
            ProviderError::ClientError { .. }
        ));
    }

    #[test]
    fn test_config_builder() {
        let config = AdapterConfig::new("openai", "sk-test")
            .with_base_url("http://localhost:8080")
            .with_models(vec!["m1".to_string()]);
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.models.len(), 1);
    }
}

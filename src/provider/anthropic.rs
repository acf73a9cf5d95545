//! Anthropic messages adapter.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::provider::adapter::{ProviderAdapter, ProviderRequest, ProviderResponse};
use crate::provider::http::{build_http_client, classify_status, AdapterConfig};

/// Adapter for the Anthropic messages API.
pub struct AnthropicAdapter {
    config: AdapterConfig,
    http: Client,
}

impl AnthropicAdapter {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MAX_TOKENS: u32 = 4096;

    /// Creates an adapter from config.
    #[must_use]
    pub fn new(config: AdapterConfig) -> Self {
        let http = build_http_client(config.timeout);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn send_prompt(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = MessagesRequest {
            model: request.model,
            messages: vec![Message {
                role: "user",
                content: request.prompt,
            }],
            max_tokens: request
                .params
                .max_tokens
                .unwrap_or(Self::DEFAULT_MAX_TOKENS),
            system: request.system,
            temperature: request.params.temperature,
            stop_sequences: request.params.stop,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let started = Instant::now();

        let send = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&body)
            .send();

        let response = tokio::select! {
            result = send => result.map_err(|e| ProviderError::Transport {
                message: e.to_string(),
            })?,
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }

        let parsed: MessagesResponse = tokio::select! {
            result = response.json() => result.map_err(|e| ProviderError::MalformedResponse {
                message: e.to_string(),
            })?,
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let text = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ProviderResponse {
            text,
            stop_reason: parsed.stop_reason,
            tokens_in: parsed.usage.as_ref().and_then(|u| u.input_tokens),
            tokens_out: parsed.usage.as_ref().and_then(|u| u.output_tokens),
            status: Some(status),
            elapsed: started.elapsed(),
        })
    }

    fn supported_models(&self) -> Vec<String> {
        self.config.models.clone()
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

//! OpenAI-compatible chat completions adapter.
//!
//! Drives any endpoint speaking the `/v1/chat/completions` dialect
//! (OpenAI, most local inference servers).

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::provider::adapter::{ProviderAdapter, ProviderRequest, ProviderResponse};
use crate::provider::http::{build_http_client, classify_status, AdapterConfig};

/// Adapter for OpenAI-compatible chat completion endpoints.
pub struct OpenAiAdapter {
    config: AdapterConfig,
    http: Client,
}

impl OpenAiAdapter {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

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

// OpenAI API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(flatten)]
    extra: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn send_prompt(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.prompt,
        });

        let body = ChatRequest {
            model: request.model,
            messages,
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
            stop: request.params.stop,
            extra: request.extra,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());
        let started = Instant::now();

        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
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

        let parsed: ChatResponse = tokio::select! {
            result = response.json() => result.map_err(|e| ProviderError::MalformedResponse {
                message: e.to_string(),
            })?,
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse {
                message: "response carried no choices".to_string(),
            })?;

        Ok(ProviderResponse {
            text: choice.message.content.unwrap_or_default(),
            stop_reason: choice.finish_reason,
            tokens_in: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            tokens_out: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
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

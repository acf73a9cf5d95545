//! Provider adapter contract.
//!
//! Every LLM backend sits behind the same narrow trait. Adding a
//! backend means compiling in a new adapter and registering it; there
//! is no dynamic loading.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

// ============================================================================
// Request / Response
// ============================================================================

/// Generation parameters forwarded to the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Completion token cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// One prompt sent to one model.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Rendered prompt; sent byte-for-byte
    pub prompt: String,

    /// Model id
    pub model: String,

    /// Generation parameters
    pub params: GenerationParams,

    /// Optional system preamble
    pub system: Option<String>,

    /// Provider-specific extra options, passed through opaquely
    pub extra: Option<serde_json::Value>,
}

/// What came back.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Raw response text
    pub text: String,

    /// Provider-reported stop reason
    pub stop_reason: Option<String>,

    /// Prompt-side tokens, when reported
    pub tokens_in: Option<u64>,

    /// Completion-side tokens, when reported
    pub tokens_out: Option<u64>,

    /// HTTP status or provider-native equivalent
    pub status: Option<u16>,

    /// Wall time for the round trip
    pub elapsed: Duration,
}

// ============================================================================
// Adapter Trait
// ============================================================================

/// Uniform request/response interface to one LLM backend.
///
/// Implementations must honor the cancellation token: on cancellation,
/// in-flight I/O is aborted and [`ProviderError::Cancelled`] returned.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Sends one prompt and waits for the response.
    async fn send_prompt(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Models this adapter can drive.
    fn supported_models(&self) -> Vec<String>;

    /// Stable provider id used in templates, specs, and results.
    fn name(&self) -> &str;
}

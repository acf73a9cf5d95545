//! Provider adapters.
//!
//! Uniform request/response interface to each LLM backend, with
//! per-provider circuit breakers.

mod adapter;
mod anthropic;
mod breaker;
mod http;
mod openai;
mod registry;
mod scripted;

pub use adapter::{GenerationParams, ProviderAdapter, ProviderRequest, ProviderResponse};
pub use anthropic::AnthropicAdapter;
pub use breaker::{BreakerState, CircuitBreaker};
pub use http::AdapterConfig;
pub use openai::OpenAiAdapter;
pub use registry::ProviderRegistry;
pub use scripted::{PromptRule, ScriptedAdapter, ScriptedStep};

//! Scripted provider adapter.
//!
//! A deterministic in-process target for tests, dry runs, and
//! detection tuning. Responses come from a finite script, substring
//! rules, or a fixed fallback, in that order.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::provider::adapter::{
    GenerationParams, ProviderAdapter, ProviderRequest, ProviderResponse,
};

/// One step of a response script.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Respond with the given text
    Respond {
        /// Response body
        text: String,
        /// Optional artificial latency
        delay: Option<Duration>,
    },
    /// Fail with a transport error
    FailTransport,
    /// Fail with a provider-overload error (as if 503)
    FailOverloaded,
    /// Fail with a client error (as if 400)
    FailClient,
}

/// Substring rule: first match wins.
#[derive(Debug, Clone)]
pub struct PromptRule {
    /// Substring to look for in the rendered prompt
    pub when_prompt_contains: String,
    /// Response body when the rule matches
    pub respond: String,
}

/// Deterministic scripted adapter.
pub struct ScriptedAdapter {
    name: String,
    models: Vec<String>,
    script: Mutex<VecDeque<ScriptedStep>>,
    rules: Vec<PromptRule>,
    fallback: String,
    permanent_failure: Option<ScriptedStep>,
    calls: AtomicU64,
}

impl ScriptedAdapter {
    /// An adapter that always responds with `text`.
    #[must_use]
    pub fn always(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            models: vec![format!("{name}-model")],
            script: Mutex::new(VecDeque::new()),
            rules: Vec::new(),
            fallback: text.to_string(),
            permanent_failure: None,
            calls: AtomicU64::new(0),
        }
    }

    /// An adapter that consumes `steps` in order, then falls back to
    /// `fallback`.
    #[must_use]
    pub fn sequence(name: &str, steps: Vec<ScriptedStep>, fallback: &str) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Self::always(name, fallback)
        }
    }

    /// An adapter that answers by substring rule, then falls back.
    #[must_use]
    pub fn match_prompt(name: &str, rules: Vec<PromptRule>, fallback: &str) -> Self {
        Self {
            rules,
            ..Self::always(name, fallback)
        }
    }

    /// An adapter that always reports overload (503).
    #[must_use]
    pub fn always_overloaded(name: &str) -> Self {
        Self::always(name, "").with_permanent_failure(ScriptedStep::FailOverloaded)
    }

    /// An adapter that always reports a client error (400).
    #[must_use]
    pub fn always_client_error(name: &str) -> Self {
        Self::always(name, "").with_permanent_failure(ScriptedStep::FailClient)
    }

    fn with_permanent_failure(mut self, step: ScriptedStep) -> Self {
        self.permanent_failure = Some(step);
        self
    }

    /// Overrides the advertised model list.
    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Number of `send_prompt` calls observed.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Convenience request builder for tests.
    #[must_use]
    pub fn request(prompt: &str) -> ProviderRequest {
        ProviderRequest {
            prompt: prompt.to_string(),
            model: "stub-model".to_string(),
            params: GenerationParams::default(),
            system: None,
            extra: None,
        }
    }

    fn next_step(&self, prompt: &str) -> ScriptedStep {
        if let Some(step) = self.permanent_failure.clone() {
            return step;
        }
        if let Some(step) = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
        {
            return step;
        }
        for rule in &self.rules {
            if prompt.contains(&rule.when_prompt_contains) {
                return ScriptedStep::Respond {
                    text: rule.respond.clone(),
                    delay: None,
                };
            }
        }
        ScriptedStep::Respond {
            text: self.fallback.clone(),
            delay: None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn send_prompt(
        &self,
        cancel: &CancellationToken,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        match self.next_step(&request.prompt) {
            ScriptedStep::Respond { text, delay } => {
                if let Some(delay) = delay {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    }
                }
                // Rough token accounting: whitespace-split words.
                let tokens_in = request.prompt.split_whitespace().count() as u64;
                let tokens_out = text.split_whitespace().count() as u64;
                Ok(ProviderResponse {
                    text,
                    stop_reason: Some("stop".to_string()),
                    tokens_in: Some(tokens_in),
                    tokens_out: Some(tokens_out),
                    status: Some(200),
                    elapsed: started.elapsed(),
                })
            }
            ScriptedStep::FailTransport => Err(ProviderError::Transport {
                message: "scripted transport failure".to_string(),
            }),
            ScriptedStep::FailOverloaded => Err(ProviderError::Overloaded {
                status: 503,
                message: "scripted overload".to_string(),
            }),
            ScriptedStep::FailClient => Err(ProviderError::ClientError {
                status: 400,
                message: "scripted client error".to_string(),
            }),
        }
    }

    fn supported_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

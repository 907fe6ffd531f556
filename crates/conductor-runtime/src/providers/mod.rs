//! LLM provider abstractions.
//!
//! The gateway talks to every backend through [`LlmProvider`]; concrete
//! HTTP implementations are feature-gated (`anthropic`, `openai`, `local`)
//! and registered through the factory in priority order.
//!
//! ## Security
//!
//! All providers hold their keys in the [`secrets`] module's
//! [`ApiCredential`], which cannot leak through Debug or Display output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use conductor_core::ExecutionError;

mod factory;
pub mod secrets;

#[cfg(feature = "anthropic")]
mod anthropic;
#[cfg(feature = "local")]
mod local;
#[cfg(feature = "openai")]
mod openai;

pub use factory::{builtin_factories, ProviderFactory, ProviderSet};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicProvider, AnthropicProviderFactory};
#[cfg(feature = "local")]
pub use local::{LocalProvider, LocalProviderFactory};
#[cfg(feature = "openai")]
pub use openai::{OpenAiProvider, OpenAiProviderFactory};

/// Errors from LLM providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    ParseError(String),

    #[error("authentication failed")]
    AuthError,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Map into the platform failure taxonomy.
    pub fn classify(&self) -> ExecutionError {
        match self {
            ProviderError::RateLimited { retry_after } => ExecutionError::RateLimited {
                retry_after: *retry_after,
            },
            ProviderError::Timeout(limit) => ExecutionError::ProviderTimeout(*limit),
            ProviderError::AuthError => ExecutionError::AuthFailed,
            ProviderError::ApiError { status, message } => {
                ExecutionError::from_provider_status(*status, message.clone())
            }
            // Connection-level failures look like a down provider
            ProviderError::HttpError(_) | ProviderError::ParseError(_) => {
                ExecutionError::ProviderServerError(502)
            }
            ProviderError::NotConfigured(message) => {
                ExecutionError::InvalidConfiguration(message.clone())
            }
        }
    }
}

/// A chat message for a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Configuration for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Hard wall-clock timeout for this attempt.
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Response from a completion call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
    /// Dollar cost of this call as computed by the provider's price table.
    pub cost_usd: f64,
}

/// Token usage from a completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Uniform contract over LLM backends.
///
/// The gateway is the only caller; it owns the breaker bookkeeping and
/// budget accounting around every invocation.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Execute a chat completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Whether the provider is configured and reachable.
    async fn health_check(&self) -> bool;

    /// Provider name for breakers, events, and metrics.
    fn name(&self) -> &str;

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u64 {
        // Simple estimate: ~4 chars per token
        (text.len() / 4) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::RetryClass;

    #[test]
    fn chat_message_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }

    #[test]
    fn token_usage_total() {
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn classification_follows_the_taxonomy() {
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(30))
                .classify()
                .retry_class(),
            RetryClass::Retryable
        );
        assert_eq!(
            ProviderError::ApiError {
                status: 429,
                message: "slow down".into()
            }
            .classify()
            .retry_class(),
            RetryClass::Retryable
        );
        assert_eq!(
            ProviderError::ApiError {
                status: 400,
                message: "bad".into()
            }
            .classify()
            .retry_class(),
            RetryClass::NonRetryable
        );
        assert_eq!(
            ProviderError::AuthError.classify().retry_class(),
            RetryClass::NonRetryable
        );
        assert_eq!(
            ProviderError::HttpError("connection refused".into())
                .classify()
                .retry_class(),
            RetryClass::Retryable
        );
    }
}

//! Classified failure taxonomy.
//!
//! Every failure the gateway or executor can observe maps onto one of these
//! variants, and the variant alone decides the disposition: drop, retry by
//! re-enqueue, or terminal failure. The gateway classifies; the executor
//! disposes.

use std::time::Duration;
use thiserror::Error;

/// How the executor should treat a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Acknowledge and drop the message; not an error.
    Ignore,
    /// Re-enqueue with backoff while attempts remain.
    Retryable,
    /// Terminal for this step; no further attempts.
    NonRetryable,
}

/// Classified failure of a governed call or step execution.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// The persisted step already reached a terminal state; this delivery is
    /// a duplicate.
    #[error("message refers to already-settled work")]
    StaleMessage,

    /// The reservation would push the run past its token ceiling.
    #[error("token budget exceeded: {used} used of {budget}")]
    BudgetExceeded { used: u64, budget: u64 },

    /// A tenant or user rate window is exhausted.
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Every provider in the priority list was open or failed.
    #[error("no provider available (attempted: {})", .attempted.join(", "))]
    AllProvidersUnavailable { attempted: Vec<String> },

    /// The provider did not answer within the per-call timeout.
    #[error("provider call timed out after {0:?}")]
    ProviderTimeout(Duration),

    /// 5xx-equivalent from the provider.
    #[error("provider server error: status {0}")]
    ProviderServerError(u16),

    /// 4xx-equivalent from the provider (429 is classified as `RateLimited`
    /// before this variant is ever constructed).
    #[error("provider client error: status {status}: {message}")]
    ProviderClientError { status: u16, message: String },

    /// Provider rejected the credentials.
    #[error("provider authentication failed")]
    AuthFailed,

    /// The task or step definition is unusable; surfaced directly on the run.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A shared-store call failed or exceeded its short timeout. A slow
    /// ledger must not stall step processing, so this is retryable.
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// The tool runtime failed in a way its status classified as transient.
    #[error("tool runtime failure: {0}")]
    ToolTransient(String),

    /// The tool runtime rejected the request outright.
    #[error("tool runtime rejected request: {0}")]
    ToolRejected(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

impl ExecutionError {
    /// The disposition this failure demands.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            ExecutionError::StaleMessage => RetryClass::Ignore,

            ExecutionError::RateLimited { .. }
            | ExecutionError::AllProvidersUnavailable { .. }
            | ExecutionError::ProviderTimeout(_)
            | ExecutionError::ProviderServerError(_)
            | ExecutionError::StoreUnavailable(_)
            | ExecutionError::ToolTransient(_) => RetryClass::Retryable,

            ExecutionError::BudgetExceeded { .. }
            | ExecutionError::ProviderClientError { .. }
            | ExecutionError::AuthFailed
            | ExecutionError::InvalidConfiguration(_)
            | ExecutionError::ToolRejected(_) => RetryClass::NonRetryable,
        }
    }

    /// Whether this failure should conclude the run as `budget_exceeded`
    /// rather than plain `failed`.
    pub fn is_budget_cause(&self) -> bool {
        matches!(self, ExecutionError::BudgetExceeded { .. })
    }

    /// Classify a provider HTTP status code.
    pub fn from_provider_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 => ExecutionError::RateLimited { retry_after: None },
            401 | 403 => ExecutionError::AuthFailed,
            s if s >= 500 => ExecutionError::ProviderServerError(s),
            s => ExecutionError::ProviderClientError {
                status: s,
                message: message.into(),
            },
        }
    }
}

//! The governed LLM gateway.
//!
//! One entry point, [`LlmGateway::complete`]: authorize against the budget
//! ledger and rate limiter, then walk the provider priority list under the
//! circuit breakers, then settle the reservation against actual usage. The
//! gateway classifies every failure and returns it; it never re-enqueues and
//! never touches step or run state — that disposition belongs to the
//! executor alone.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use conductor_core::{CallOutcome, ExecutionError, LlmCallEvent, RunId, StepId, TenantId, UserId};

use crate::cache::{CacheKey, CompletionCache};
use crate::config::{BreachPolicy, GatewayConfig};
use crate::events::EventSink;
use crate::governance::{
    Admission, BreakerRegistry, BudgetError, BudgetLedger, RateDecision, RateLimiter, StoreError,
};
use crate::providers::{ChatMessage, CompletionConfig, ProviderSet, TokenUsage};

/// Errors from the gateway, fully classified for the executor.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("token budget exceeded: {used} used of {budget}")]
    BudgetExceeded { used: u64, budget: u64 },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("all providers unavailable (attempted: {})", .attempted.join(", "))]
    AllProvidersUnavailable { attempted: Vec<String> },

    #[error("invalid completion request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BudgetError> for GatewayError {
    fn from(e: BudgetError) -> Self {
        match e {
            BudgetError::Exceeded { used, budget } => GatewayError::BudgetExceeded { used, budget },
            BudgetError::Store(e) => GatewayError::Store(e),
        }
    }
}

impl GatewayError {
    /// Map into the platform failure taxonomy.
    pub fn classify(&self) -> ExecutionError {
        match self {
            GatewayError::BudgetExceeded { used, budget } => ExecutionError::BudgetExceeded {
                used: *used,
                budget: *budget,
            },
            GatewayError::RateLimited { retry_after } => ExecutionError::RateLimited {
                retry_after: Some(*retry_after),
            },
            GatewayError::AllProvidersUnavailable { attempted } => {
                ExecutionError::AllProvidersUnavailable {
                    attempted: attempted.clone(),
                }
            }
            GatewayError::InvalidRequest(msg) => ExecutionError::InvalidConfiguration(msg.clone()),
            GatewayError::Store(e) => ExecutionError::StoreUnavailable(e.to_string()),
        }
    }
}

/// One governed completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub run_id: RunId,
    pub step_id: StepId,

    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,

    /// The run's immutable token ceiling; the executor owns the Run record
    /// and supplies it here.
    pub token_budget: u64,
    /// Tokens to reserve before the call. 0 = estimate from the prompt.
    pub estimated_tokens: u64,
}

/// Result of a governed completion.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
    pub provider: String,
    pub cost_usd: f64,
    pub latency_ms: u64,

    /// True when a provider other than the first attempted one answered.
    pub is_fallback: bool,
    pub previous_provider: Option<String>,

    /// Served from the completion cache; no provider call, no tokens billed.
    pub cached: bool,
    /// Actual usage breached the run budget and the breach policy is
    /// `Immediate`: the executor should conclude the run now.
    pub budget_breached: bool,
}

/// Composes the budget ledger, rate limiter, breaker registry, provider
/// set, and completion cache into one governed call path.
pub struct LlmGateway {
    providers: ProviderSet,
    ledger: BudgetLedger,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    cache: CompletionCache,
    events: Arc<dyn EventSink>,
    config: GatewayConfig,
}

impl LlmGateway {
    pub fn new(
        providers: ProviderSet,
        ledger: BudgetLedger,
        limiter: RateLimiter,
        breakers: BreakerRegistry,
        cache: CompletionCache,
        events: Arc<dyn EventSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            providers,
            ledger,
            limiter,
            breakers,
            cache,
            events,
            config,
        }
    }

    /// Authorize, execute, and account for one model call, failing over
    /// across providers in priority order.
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest("no messages".to_string()));
        }
        if request.model.is_empty() {
            return Err(GatewayError::InvalidRequest("no model".to_string()));
        }

        // Budget first: reserve the estimate against the run's remaining
        // budget. Failure here means zero provider calls and nothing held.
        let estimate = if request.estimated_tokens > 0 {
            request.estimated_tokens
        } else {
            self.estimate_tokens(&request)
        };
        let reservation = match self
            .ledger
            .check_and_reserve(
                request.run_id,
                request.tenant_id,
                request.token_budget,
                estimate,
            )
            .await
        {
            Ok(reservation) => reservation,
            Err(BudgetError::Exceeded { used, budget }) => {
                return Err(GatewayError::BudgetExceeded { used, budget });
            }
            Err(BudgetError::Store(e)) => return Err(GatewayError::Store(e)),
        };

        // Rate check for both identities. Every early exit from here on
        // releases the hold in full.
        let rate = match self.limiter.check(request.tenant_id, request.user_id).await {
            Ok(decision) => decision,
            Err(e) => {
                self.ledger.release(reservation).await?;
                return Err(GatewayError::Store(e));
            }
        };
        if let RateDecision::Limited { retry_after, .. } = rate {
            self.ledger.release(reservation).await?;
            return Err(GatewayError::RateLimited { retry_after });
        }

        // Identical request already answered within the TTL: no provider
        // call, nothing billed.
        let cache_key = CacheKey::new(&request.model, &request.messages);
        if let Some(hit) = self.cache.get(&cache_key).await {
            self.ledger.release(reservation).await?;
            tracing::debug!(
                run_id = %request.run_id,
                model = %request.model,
                "completion served from cache"
            );
            return Ok(hit);
        }

        match self.iterate_providers(&request).await {
            Ok(success) => {
                let settlement = self
                    .ledger
                    .reconcile(reservation, success.usage.total())
                    .await?;
                let mut response = success;
                response.budget_breached = settlement.breached
                    && self.config.budget.breach_policy == BreachPolicy::Immediate;

                self.cache.insert(cache_key, response.clone()).await;
                Ok(response)
            }
            Err(attempted) => {
                // Nothing was consumed; release the full hold.
                self.ledger.release(reservation).await?;
                Err(GatewayError::AllProvidersUnavailable { attempted })
            }
        }
    }

    /// Walk the priority list under the breakers. Returns the successful
    /// response or the list of providers attempted or skipped.
    async fn iterate_providers(
        &self,
        request: &CompletionRequest,
    ) -> Result<GatewayResponse, Vec<String>> {
        let call_config = CompletionConfig {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(1000),
            temperature: request.temperature.unwrap_or(0.7),
            timeout: self.config.provider_timeout,
        };

        // Providers tried or breaker-skipped so far; a success after any
        // entry here is a failover.
        let mut attempted: Vec<String> = Vec::new();

        for provider in self.providers.iter() {
            let name = provider.name().to_string();

            let admission = match self.breakers.admit(&name).await {
                Ok(admission) => admission,
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "breaker check failed, skipping");
                    attempted.push(name);
                    continue;
                }
            };
            if admission == Admission::ShortCircuit {
                tracing::debug!(provider = %name, "breaker open, skipping provider");
                attempted.push(name);
                continue;
            }

            let is_fallback = !attempted.is_empty();
            let previous_provider = attempted.last().cloned();
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.config.provider_timeout,
                provider.complete(&request.messages, &call_config),
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let mut event = LlmCallEvent::for_attempt(
                request.run_id,
                request.step_id,
                request.tenant_id,
                &name,
                &request.model,
            );
            event.latency_ms = latency_ms;
            event.is_fallback = is_fallback;
            event.previous_provider = previous_provider.clone();

            match result {
                Ok(Ok(response)) => {
                    if let Err(e) = self.breakers.record_success(&name).await {
                        tracing::warn!(provider = %name, error = %e, "failed to record breaker success");
                    }

                    event.prompt_tokens = response.usage.prompt_tokens;
                    event.completion_tokens = response.usage.completion_tokens;
                    event.total_tokens = response.usage.total();
                    event.cost_usd = response.cost_usd;
                    self.events.llm_call(&event);

                    tracing::info!(
                        provider = %name,
                        model = %response.model,
                        tokens = response.usage.total(),
                        latency_ms,
                        is_fallback,
                        "provider call succeeded"
                    );

                    return Ok(GatewayResponse {
                        content: response.content,
                        usage: response.usage,
                        model: response.model,
                        provider: name,
                        cost_usd: response.cost_usd,
                        latency_ms,
                        is_fallback,
                        previous_provider,
                        cached: false,
                        budget_breached: false,
                    });
                }
                Ok(Err(provider_error)) => {
                    if let Err(e) = self.breakers.record_failure(&name).await {
                        tracing::warn!(provider = %name, error = %e, "failed to record breaker failure");
                    }
                    event.outcome = CallOutcome::Failed(provider_error.to_string());
                    self.events.llm_call(&event);

                    tracing::warn!(
                        provider = %name,
                        error = %provider_error,
                        "provider call failed, trying next"
                    );
                }
                Err(_elapsed) => {
                    if let Err(e) = self.breakers.record_failure(&name).await {
                        tracing::warn!(provider = %name, error = %e, "failed to record breaker failure");
                    }
                    event.outcome = CallOutcome::Failed(format!(
                        "timed out after {:?}",
                        self.config.provider_timeout
                    ));
                    self.events.llm_call(&event);

                    tracing::warn!(
                        provider = %name,
                        timeout = ?self.config.provider_timeout,
                        "provider call timed out, trying next"
                    );
                }
            }

            attempted.push(name);
        }

        Err(attempted)
    }

    fn estimate_tokens(&self, request: &CompletionRequest) -> u64 {
        // ~4 chars per token across the whole conversation, plus the
        // completion ceiling.
        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        (prompt_chars / 4) as u64 + request.max_tokens.unwrap_or(1000) as u64
    }

    /// Breaker states per provider, for health reporting.
    pub async fn provider_health(
        &self,
    ) -> Result<Vec<(String, crate::governance::BreakerState)>, StoreError> {
        let mut health = Vec::new();
        for provider in self.providers.iter() {
            let state = self.breakers.state(provider.name()).await?;
            health.push((provider.name().to_string(), state));
        }
        Ok(health)
    }
}

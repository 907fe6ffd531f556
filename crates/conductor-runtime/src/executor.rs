//! The step executor.
//!
//! Drives one delivered message through the step state machine: claim the
//! step, execute its work unit through the gateway or tool runtime, settle
//! the outcome, and decide retry versus terminal disposition. Exactly-once
//! *effective* execution under at-least-once delivery comes from the
//! conditional updates in the state store — the persisted `(status,
//! attempt)` pair is authoritative and the loser of any race drops its
//! message without mutating state.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use chrono::Utc;

use conductor_core::{
    BackoffPolicy, ExecutionError, RetryClass, Run, RunStatus, Step, StepMessage,
    StepProgressEvent, StepStatus, WorkUnit,
};

use crate::config::RuntimeConfig;
use crate::events::EventSink;
use crate::gateway::{CompletionRequest, LlmGateway};
use crate::providers::ChatMessage;
use crate::queue::{QueueAdapter, QueueError};
use crate::state::{ClaimOutcome, RunProgress, StateError, StateStore, StepCompletion};
use crate::tools::{ToolError, ToolRequest, ToolRuntime, ToolStatus};

/// Infrastructure errors the executor cannot resolve itself. The worker
/// leaves the message in flight; the visibility timeout redelivers it.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Why a message was acknowledged without executing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The persisted step is already terminal (duplicate delivery).
    StaleMessage,
    /// The run is no longer `running` (cancelled or concluded).
    RunNotActive,
    /// The message's attempt number disagrees with the persisted record.
    AttemptMismatch,
    /// The step or run does not exist.
    UnknownTarget,
}

/// How one delivery was resolved. Every variant acknowledges the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Step succeeded; the run advanced or completed.
    Completed,
    /// Retryable failure; a follow-up message was enqueued.
    Retried { next_attempt: u32, delay: Duration },
    /// Terminal step failure.
    Failed,
    /// Nothing executed.
    Dropped(DropReason),
}

/// Executes delivered step messages to completion or terminal failure.
pub struct StepExecutor {
    state: Arc<dyn StateStore>,
    gateway: Arc<LlmGateway>,
    tools: Arc<dyn ToolRuntime>,
    queue: Arc<dyn QueueAdapter>,
    events: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
    tool_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        state: Arc<dyn StateStore>,
        gateway: Arc<LlmGateway>,
        tools: Arc<dyn ToolRuntime>,
        queue: Arc<dyn QueueAdapter>,
        events: Arc<dyn EventSink>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            state,
            gateway,
            tools,
            queue,
            events,
            backoff: config.retry.policy(),
            tool_timeout: config.gateway.tool_timeout,
        }
    }

    /// Process one delivered message to a disposition.
    pub async fn process(&self, message: &StepMessage) -> Result<Disposition, ExecutorError> {
        let Some(step) = self.state.load_step(message.step_id).await? else {
            tracing::warn!(step_id = %message.step_id, "message for unknown step, dropping");
            return Ok(Disposition::Dropped(DropReason::UnknownTarget));
        };

        // Duplicate-delivery guard: a settled step never re-executes.
        if step.status.is_terminal() {
            tracing::debug!(
                step_id = %step.id,
                status = %step.status,
                "step already settled, dropping duplicate delivery"
            );
            return Ok(Disposition::Dropped(DropReason::StaleMessage));
        }

        let Some(run) = self.state.load_run(message.run_id).await? else {
            tracing::warn!(run_id = %message.run_id, "message for unknown run, dropping");
            return Ok(Disposition::Dropped(DropReason::UnknownTarget));
        };
        if run.status != RunStatus::Running {
            tracing::info!(
                run_id = %run.id,
                status = %run.status,
                "run no longer active, dropping step message"
            );
            return Ok(Disposition::Dropped(DropReason::RunNotActive));
        }

        // The persisted attempt counter is authoritative over the message.
        if step.attempt != message.attempt {
            tracing::warn!(
                step_id = %step.id,
                message_attempt = message.attempt,
                persisted_attempt = step.attempt,
                "attempt mismatch, persisted record wins"
            );
            return Ok(Disposition::Dropped(DropReason::AttemptMismatch));
        }

        let step = match self
            .state
            .claim_step(step.id, message.attempt, Utc::now())
            .await?
        {
            ClaimOutcome::Claimed(step) => step,
            ClaimOutcome::Stale { .. } => {
                return Ok(Disposition::Dropped(DropReason::StaleMessage));
            }
        };
        self.emit_progress(&step, Some(StepStatus::Queued), StepStatus::Running);

        tracing::info!(
            run_id = %run.id,
            step_id = %step.id,
            step_name = %step.name,
            kind = step.work.kind(),
            attempt = step.attempt,
            "step execution started"
        );

        match self.execute_work(&run, &step).await {
            Ok(outcome) => self.settle_success(&run, &step, outcome).await,
            Err(error) => self.settle_failure(&run, &step, error).await,
        }
    }

    /// Run the step's work unit through the gateway or the tool runtime.
    async fn execute_work(&self, run: &Run, step: &Step) -> Result<WorkOutcome, ExecutionError> {
        match &step.work {
            WorkUnit::Llm {
                model,
                prompt,
                system_prompt,
                max_tokens,
                temperature,
            } => {
                let mut messages = Vec::new();
                if let Some(system) = system_prompt {
                    messages.push(ChatMessage::system(system.clone()));
                }
                messages.push(ChatMessage::user(prompt.clone()));

                let response = self
                    .gateway
                    .complete(CompletionRequest {
                        tenant_id: run.tenant_id,
                        user_id: run.created_by,
                        run_id: run.id,
                        step_id: step.id,
                        model: model.clone(),
                        messages,
                        max_tokens: *max_tokens,
                        temperature: *temperature,
                        token_budget: run.token_budget,
                        estimated_tokens: 0,
                    })
                    .await
                    .map_err(|e| e.classify())?;

                Ok(WorkOutcome {
                    output: serde_json::json!({
                        "content": response.content,
                        "model": response.model,
                        "provider": response.provider,
                        "cached": response.cached,
                    }),
                    tokens_used: response.usage.total(),
                    cost_usd: response.cost_usd,
                    budget_breached: response.budget_breached,
                })
            }
            WorkUnit::Tool {
                tool,
                params,
                timeout_seconds,
            } => {
                let timeout = timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(self.tool_timeout);
                let request = ToolRequest {
                    tool: tool.clone(),
                    params: params.clone(),
                    run_id: run.id,
                    step_id: step.id,
                    timeout_seconds: timeout.as_secs(),
                };

                let outcome = match tokio::time::timeout(timeout, self.tools.execute(request)).await
                {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(tool_error)) => return Err(tool_error.classify()),
                    Err(_elapsed) => return Err(ToolError::Timeout(timeout).classify()),
                };

                if outcome.status == ToolStatus::Failed {
                    let detail = outcome
                        .output
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("tool reported failure")
                        .to_string();
                    return Err(ToolError::Failed(detail).classify());
                }

                Ok(WorkOutcome {
                    output: serde_json::json!({
                        "output": outcome.output,
                        "artifacts": outcome.artifacts,
                    }),
                    tokens_used: 0,
                    cost_usd: 0.0,
                    budget_breached: false,
                })
            }
        }
    }

    async fn settle_success(
        &self,
        run: &Run,
        step: &Step,
        outcome: WorkOutcome,
    ) -> Result<Disposition, ExecutorError> {
        let committed = self
            .state
            .finish_step(
                step.id,
                step.attempt,
                StepCompletion {
                    status: StepStatus::Success,
                    output: Some(outcome.output),
                    error_message: None,
                    tokens_used: outcome.tokens_used,
                    cost_usd: outcome.cost_usd,
                    completed_at: Utc::now(),
                },
            )
            .await?;
        if !committed {
            tracing::warn!(
                step_id = %step.id,
                "lost settle race after execution, dropping"
            );
            return Ok(Disposition::Dropped(DropReason::StaleMessage));
        }

        self.emit_progress(step, Some(StepStatus::Running), StepStatus::Success);
        self.state
            .record_run_usage(run.id, outcome.tokens_used, outcome.cost_usd)
            .await?;

        tracing::info!(
            run_id = %run.id,
            step_id = %step.id,
            tokens = outcome.tokens_used,
            "step execution completed"
        );

        // Actual usage breached the budget under the immediate policy: the
        // step's result stands, but no further step may start.
        if outcome.budget_breached {
            self.conclude_run(
                run.id,
                RunStatus::BudgetExceeded,
                Some("token budget exceeded by settled usage".to_string()),
            )
            .await?;
            return Ok(Disposition::Completed);
        }

        self.advance_run(run, step).await?;
        Ok(Disposition::Completed)
    }

    /// Move the run past a settled step: dispatch the next step or conclude.
    async fn advance_run(&self, run: &Run, step: &Step) -> Result<(), ExecutorError> {
        // Finalization observes cancellation: a run concluded while this
        // step was in flight is left alone.
        match self.state.load_run(run.id).await? {
            Some(current) if current.status == RunStatus::Running => {}
            _ => {
                tracing::info!(
                    run_id = %run.id,
                    "run concluded while step was in flight, not advancing"
                );
                return Ok(());
            }
        }

        match self.state.advance_run_step(run.id, step.order).await? {
            RunProgress::Next(next) => {
                self.queue
                    .send(
                        StepMessage::first_attempt(run.id, next.id).to_body(),
                        Duration::ZERO,
                    )
                    .await?;
                tracing::debug!(
                    run_id = %run.id,
                    next_step = %next.name,
                    order = next.order,
                    "next step dispatched"
                );
            }
            RunProgress::Finished => {
                self.conclude_run(run.id, RunStatus::Completed, None).await?;
                tracing::info!(run_id = %run.id, "run completed");
            }
        }
        Ok(())
    }

    /// Conclude a run, tolerating a concurrent conclusion: if another
    /// writer (or a cancellation) already made the run terminal, that
    /// outcome stands.
    async fn conclude_run(
        &self,
        run_id: conductor_core::RunId,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<(), ExecutorError> {
        match self.state.set_run_status(run_id, status, error_message).await {
            Ok(()) => Ok(()),
            Err(StateError::IllegalTransition(detail)) => {
                tracing::warn!(run_id = %run_id, detail = %detail, "run already concluded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle_failure(
        &self,
        run: &Run,
        step: &Step,
        error: ExecutionError,
    ) -> Result<Disposition, ExecutorError> {
        match error.retry_class() {
            RetryClass::Ignore => Ok(Disposition::Dropped(DropReason::StaleMessage)),

            RetryClass::Retryable if step.attempt < step.max_attempts => {
                let committed = self
                    .state
                    .requeue_step(step.id, step.attempt, error.to_string())
                    .await?;
                if !committed {
                    return Ok(Disposition::Dropped(DropReason::StaleMessage));
                }

                self.emit_progress(step, Some(StepStatus::Running), StepStatus::Retrying);
                self.emit_progress(step, Some(StepStatus::Retrying), StepStatus::Queued);

                let next_attempt = step.attempt + 1;
                let delay = self.backoff.delay_for_attempt(next_attempt);
                self.queue
                    .send(
                        StepMessage {
                            run_id: run.id,
                            step_id: step.id,
                            attempt: next_attempt,
                        }
                        .to_body(),
                        delay,
                    )
                    .await?;

                tracing::warn!(
                    run_id = %run.id,
                    step_id = %step.id,
                    attempt = step.attempt,
                    next_attempt,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "step failed, retrying"
                );
                Ok(Disposition::Retried {
                    next_attempt,
                    delay,
                })
            }

            // Non-retryable, or attempts exhausted.
            _ => {
                let committed = self
                    .state
                    .finish_step(
                        step.id,
                        step.attempt,
                        StepCompletion {
                            status: StepStatus::Failed,
                            output: None,
                            error_message: Some(error.to_string()),
                            tokens_used: 0,
                            cost_usd: 0.0,
                            completed_at: Utc::now(),
                        },
                    )
                    .await?;
                if !committed {
                    return Ok(Disposition::Dropped(DropReason::StaleMessage));
                }
                self.emit_progress(step, Some(StepStatus::Running), StepStatus::Failed);

                tracing::error!(
                    run_id = %run.id,
                    step_id = %step.id,
                    attempt = step.attempt,
                    error = %error,
                    "step failed permanently"
                );

                if step.critical {
                    let status = if error.is_budget_cause() {
                        RunStatus::BudgetExceeded
                    } else {
                        RunStatus::Failed
                    };
                    self.conclude_run(run.id, status, Some(error.to_string()))
                        .await?;
                } else {
                    // Non-critical step: the run proceeds to its next step.
                    tracing::info!(
                        run_id = %run.id,
                        step_id = %step.id,
                        "non-critical step failed, run proceeds"
                    );
                    self.advance_run(run, step).await?;
                }
                Ok(Disposition::Failed)
            }
        }
    }

    fn emit_progress(&self, step: &Step, from: Option<StepStatus>, to: StepStatus) {
        self.events.step_progress(&StepProgressEvent::new(
            step.run_id,
            step.id,
            step.name.clone(),
            from,
            to,
            step.attempt,
        ));
    }
}

struct WorkOutcome {
    output: serde_json::Value,
    tokens_used: u64,
    cost_usd: f64,
    budget_breached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompletionCache;
    use crate::config::GatewayConfig;
    use crate::events::MemoryEventSink;
    use crate::governance::{
        BreakerRegistry, BudgetLedger, MemoryGovernanceStore, RateLimiter,
    };
    use crate::providers::{
        CompletionConfig, CompletionResponse, LlmProvider, ProviderError, ProviderSet, TokenUsage,
    };
    use crate::queue::InMemoryQueue;
    use crate::state::MemoryStateStore;
    use crate::tools::{ToolOutcome, ToolRuntime};
    use async_trait::async_trait;
    use conductor_core::TenantId;
    use parking_lot::Mutex;
    use uuid::Uuid;

    struct StaticProvider;

    #[async_trait]
    impl LlmProvider for StaticProvider {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: "done".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 40,
                    completion_tokens: 10,
                },
                model: "gpt-4".to_string(),
                cost_usd: 0.002,
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    /// Tool runtime scripted to fail a fixed number of times, then succeed.
    struct FlakyTool {
        failures_left: Mutex<u32>,
    }

    impl FlakyTool {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: Mutex::new(times),
            }
        }
    }

    #[async_trait]
    impl ToolRuntime for FlakyTool {
        async fn execute(&self, _request: ToolRequest) -> Result<ToolOutcome, ToolError> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(ToolError::Timeout(Duration::from_secs(60)));
            }
            Ok(ToolOutcome {
                output: serde_json::json!({ "ok": true }),
                artifacts: vec![],
                status: ToolStatus::Success,
            })
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct Harness {
        state: Arc<MemoryStateStore>,
        queue: Arc<InMemoryQueue>,
        events: Arc<MemoryEventSink>,
        executor: StepExecutor,
    }

    fn harness(tool: Arc<dyn ToolRuntime>) -> Harness {
        let config = RuntimeConfig::default();
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        let events = Arc::new(MemoryEventSink::new());
        let gov = Arc::new(MemoryGovernanceStore::new());
        let gateway_config = GatewayConfig::default();

        let gateway = Arc::new(LlmGateway::new(
            ProviderSet::from_providers(vec![Arc::new(StaticProvider)]),
            BudgetLedger::new(Arc::clone(&gov) as _, gateway_config.budget.clone()),
            RateLimiter::new(
                Arc::clone(&gov) as _,
                gateway_config.rate_limit.clone(),
                gateway_config.budget.store_timeout,
            ),
            BreakerRegistry::new(Arc::clone(&gov) as _, gateway_config.circuit_breaker.clone()),
            CompletionCache::new(&gateway_config.cache),
            Arc::clone(&events) as _,
            gateway_config,
        ));

        let executor = StepExecutor::new(
            Arc::clone(&state) as _,
            gateway,
            tool,
            Arc::clone(&queue) as _,
            Arc::clone(&events) as _,
            &config,
        );

        Harness {
            state,
            queue,
            events,
            executor,
        }
    }

    fn seed_tool_run(state: &MemoryStateStore, steps: u32, max_attempts: u32) -> (Run, Vec<Step>) {
        let run = Run::new(TenantId::new(), Uuid::new_v4(), 10_000, steps);
        let planned: Vec<Step> = (0..steps)
            .map(|i| {
                Step::new(
                    run.id,
                    format!("tool-{i}"),
                    WorkUnit::Tool {
                        tool: "browser".to_string(),
                        params: serde_json::json!({}),
                        timeout_seconds: None,
                    },
                    i,
                )
                .with_max_attempts(max_attempts)
            })
            .collect();
        state.insert_run(run.clone(), planned.clone());
        (run, planned)
    }

    #[tokio::test]
    async fn successful_step_advances_and_dispatches_next() {
        let h = harness(Arc::new(FlakyTool::failing(0)));
        let (run, steps) = seed_tool_run(&h.state, 2, 3);

        let disposition = h
            .executor
            .process(&StepMessage::first_attempt(run.id, steps[0].id))
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Completed);

        assert_eq!(h.state.step(steps[0].id).unwrap().status, StepStatus::Success);
        assert_eq!(h.state.run(run.id).unwrap().current_step, 1);
        // The next step's message is on the queue
        assert_eq!(h.queue.depth(), 1);
    }

    #[tokio::test]
    async fn last_step_completes_the_run() {
        let h = harness(Arc::new(FlakyTool::failing(0)));
        let (run, steps) = seed_tool_run(&h.state, 1, 3);

        h.executor
            .process(&StepMessage::first_attempt(run.id, steps[0].id))
            .await
            .unwrap();
        assert_eq!(h.state.run(run.id).unwrap().status, RunStatus::Completed);
        assert_eq!(h.queue.depth(), 0);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let h = harness(Arc::new(FlakyTool::failing(1)));
        let (run, steps) = seed_tool_run(&h.state, 1, 3);

        let disposition = h
            .executor
            .process(&StepMessage::first_attempt(run.id, steps[0].id))
            .await
            .unwrap();
        assert_eq!(
            disposition,
            Disposition::Retried {
                next_attempt: 2,
                delay: Duration::from_secs(2),
            }
        );

        let step = h.state.step(steps[0].id).unwrap();
        assert_eq!(step.status, StepStatus::Queued);
        assert_eq!(step.attempt, 2);
        assert_eq!(h.queue.depth(), 1);
    }

    #[tokio::test]
    async fn attempts_exhausted_fails_run() {
        let h = harness(Arc::new(FlakyTool::failing(10)));
        let (run, steps) = seed_tool_run(&h.state, 1, 2);

        let first = h
            .executor
            .process(&StepMessage::first_attempt(run.id, steps[0].id))
            .await
            .unwrap();
        assert!(matches!(first, Disposition::Retried { next_attempt: 2, .. }));

        let second = h
            .executor
            .process(&StepMessage {
                run_id: run.id,
                step_id: steps[0].id,
                attempt: 2,
            })
            .await
            .unwrap();
        assert_eq!(second, Disposition::Failed);

        assert_eq!(h.state.step(steps[0].id).unwrap().status, StepStatus::Failed);
        assert_eq!(h.state.run(run.id).unwrap().status, RunStatus::Failed);
        // No attempt 3 message was enqueued
        assert_eq!(h.queue.depth(), 0);
    }

    #[tokio::test]
    async fn non_critical_failure_lets_run_proceed() {
        let h = harness(Arc::new(FlakyTool::failing(10)));
        let run = Run::new(TenantId::new(), Uuid::new_v4(), 10_000, 2);
        let flaky = Step::new(
            run.id,
            "optional",
            WorkUnit::Tool {
                tool: "browser".to_string(),
                params: serde_json::json!({}),
                timeout_seconds: None,
            },
            0,
        )
        .with_max_attempts(1)
        .with_critical(false);
        let follow_up = Step::new(
            run.id,
            "required",
            WorkUnit::Tool {
                tool: "browser".to_string(),
                params: serde_json::json!({}),
                timeout_seconds: None,
            },
            1,
        );
        h.state
            .insert_run(run.clone(), vec![flaky.clone(), follow_up]);

        let disposition = h
            .executor
            .process(&StepMessage::first_attempt(run.id, flaky.id))
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Failed);

        // Step failed but the run is still running with step 1 dispatched
        assert_eq!(h.state.run(run.id).unwrap().status, RunStatus::Running);
        assert_eq!(h.state.run(run.id).unwrap().current_step, 1);
        assert_eq!(h.queue.depth(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_dropped() {
        let h = harness(Arc::new(FlakyTool::failing(0)));
        let (run, steps) = seed_tool_run(&h.state, 1, 3);
        let message = StepMessage::first_attempt(run.id, steps[0].id);

        h.executor.process(&message).await.unwrap();
        let duplicate = h.executor.process(&message).await.unwrap();
        assert_eq!(duplicate, Disposition::Dropped(DropReason::StaleMessage));
    }

    #[tokio::test]
    async fn cancelled_run_drops_messages() {
        let h = harness(Arc::new(FlakyTool::failing(0)));
        let (run, steps) = seed_tool_run(&h.state, 1, 3);
        h.state
            .set_run_status(run.id, RunStatus::Cancelled, None)
            .await
            .unwrap();

        let disposition = h
            .executor
            .process(&StepMessage::first_attempt(run.id, steps[0].id))
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Dropped(DropReason::RunNotActive));
        assert_eq!(h.state.step(steps[0].id).unwrap().status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn attempt_mismatch_defers_to_persisted_record() {
        let h = harness(Arc::new(FlakyTool::failing(0)));
        let (run, steps) = seed_tool_run(&h.state, 1, 3);

        let disposition = h
            .executor
            .process(&StepMessage {
                run_id: run.id,
                step_id: steps[0].id,
                attempt: 2,
            })
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Dropped(DropReason::AttemptMismatch));
        assert_eq!(h.state.step(steps[0].id).unwrap().status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn llm_step_records_usage_on_run() {
        let h = harness(Arc::new(FlakyTool::failing(0)));
        let run = Run::new(TenantId::new(), Uuid::new_v4(), 10_000, 1);
        let step = Step::new(
            run.id,
            "summarize",
            WorkUnit::Llm {
                model: "gpt-4".to_string(),
                prompt: "Summarize the findings".to_string(),
                system_prompt: None,
                max_tokens: Some(200),
                temperature: None,
            },
            0,
        );
        h.state.insert_run(run.clone(), vec![step.clone()]);

        let disposition = h
            .executor
            .process(&StepMessage::first_attempt(run.id, step.id))
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Completed);

        let settled = h.state.step(step.id).unwrap();
        assert_eq!(settled.tokens_used, 50);
        assert_eq!(h.state.run(run.id).unwrap().tokens_used, 50);
        assert_eq!(h.events.llm_calls().len(), 1);
    }

    #[tokio::test]
    async fn progress_events_trace_every_transition() {
        let h = harness(Arc::new(FlakyTool::failing(0)));
        let (run, steps) = seed_tool_run(&h.state, 1, 3);

        h.executor
            .process(&StepMessage::first_attempt(run.id, steps[0].id))
            .await
            .unwrap();

        let transitions: Vec<StepStatus> =
            h.events.progress_events().iter().map(|e| e.to).collect();
        assert_eq!(transitions, vec![StepStatus::Running, StepStatus::Success]);
    }
}

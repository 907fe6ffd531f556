//! The worker loop.
//!
//! Long-polls the queue and drives each delivered message through the
//! executor, up to the configured fan-out in flight at once. Workers scale
//! horizontally; nothing here is shared between instances except the queue
//! and the stores behind their traits.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

use conductor_core::StepMessage;

use crate::config::RuntimeConfig;
use crate::executor::StepExecutor;
use crate::queue::{QueueAdapter, QueueMessage};

/// Pulls step messages and processes them until shut down.
pub struct Worker {
    queue: Arc<dyn QueueAdapter>,
    executor: Arc<StepExecutor>,
    config: RuntimeConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn QueueAdapter>,
        executor: Arc<StepExecutor>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            config,
        }
    }

    /// Run until `shutdown` observes `true`. In-flight messages run to
    /// completion; no new batch is received after the signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let worker_id = self.config.worker.worker_id.clone();
        tracing::info!(worker_id = %worker_id, "worker polling started");

        while !*shutdown.borrow() {
            let batch = tokio::select! {
                batch = self.receive_with_retry() => batch,
                _ = shutdown.changed() => break,
            };

            if batch.is_empty() {
                continue;
            }
            tracing::debug!(worker_id = %worker_id, count = batch.len(), "messages received");

            let mut in_flight = FuturesUnordered::new();
            for message in batch {
                in_flight.push(self.process_message(message));
                // Bound the fan-out within this batch
                if in_flight.len() >= self.config.worker.concurrency {
                    in_flight.next().await;
                }
            }
            while in_flight.next().await.is_some() {}
        }

        tracing::info!(worker_id = %worker_id, "worker polling stopped");
    }

    /// Receive one batch, retrying transient queue errors with backoff so a
    /// queue blip does not become a tight error loop.
    async fn receive_with_retry(&self) -> Vec<QueueMessage> {
        let receive = || async {
            self.queue
                .receive(self.config.queue.max_messages, self.config.queue.wait_time)
                .await
        };
        match receive
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(200))
                    .with_max_delay(Duration::from_secs(5))
                    .with_max_times(5),
            )
            .notify(|err, delay: Duration| {
                tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "queue receive failed, backing off");
            })
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "queue receive failing persistently");
                Vec::new()
            }
        }
    }

    /// Process one delivery end to end, then acknowledge it.
    ///
    /// Every disposition acknowledges: retry means a *new* delayed message
    /// was enqueued. Only an infrastructure error leaves the message in
    /// flight for the visibility timeout to redeliver.
    async fn process_message(&self, message: QueueMessage) {
        let step_message = match StepMessage::from_body(&message.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    error = %e,
                    "unparseable message body, acknowledging"
                );
                self.ack(&message).await;
                return;
            }
        };

        match self.executor.process(&step_message).await {
            Ok(disposition) => {
                tracing::debug!(
                    message_id = %message.id,
                    step_id = %step_message.step_id,
                    ?disposition,
                    "message resolved"
                );
                self.ack(&message).await;
            }
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    step_id = %step_message.step_id,
                    error = %e,
                    "message processing failed, leaving for redelivery"
                );
            }
        }
    }

    async fn ack(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(message).await {
            tracing::warn!(message_id = %message.id, error = %e, "failed to delete message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompletionCache;
    use crate::config::GatewayConfig;
    use crate::events::MemoryEventSink;
    use crate::gateway::LlmGateway;
    use crate::governance::{
        BreakerRegistry, BudgetLedger, MemoryGovernanceStore, RateLimiter,
    };
    use crate::providers::{
        ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
        ProviderSet, TokenUsage,
    };
    use crate::queue::InMemoryQueue;
    use crate::state::MemoryStateStore;
    use crate::tools::{ToolError, ToolOutcome, ToolRequest, ToolRuntime, ToolStatus};
    use async_trait::async_trait;
    use conductor_core::{Run, RunStatus, Step, TenantId, WorkUnit};
    use uuid::Uuid;

    struct OkProvider;

    #[async_trait]
    impl LlmProvider for OkProvider {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: "ok".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 5,
                    completion_tokens: 5,
                },
                model: "gpt-4".to_string(),
                cost_usd: 0.0,
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "ok"
        }
    }

    struct OkTool;

    #[async_trait]
    impl ToolRuntime for OkTool {
        async fn execute(&self, _request: ToolRequest) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome {
                output: serde_json::json!({}),
                artifacts: vec![],
                status: ToolStatus::Success,
            })
        }

        fn name(&self) -> &str {
            "ok"
        }
    }

    #[tokio::test]
    async fn worker_drains_a_run_to_completion() {
        let mut config = RuntimeConfig::default();
        config.queue.wait_time = Duration::from_millis(50);

        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        let events = Arc::new(MemoryEventSink::new());
        let gov = Arc::new(MemoryGovernanceStore::new());
        let gateway_config = GatewayConfig::default();

        let gateway = Arc::new(LlmGateway::new(
            ProviderSet::from_providers(vec![Arc::new(OkProvider)]),
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

        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&state) as _,
            gateway,
            Arc::new(OkTool),
            Arc::clone(&queue) as _,
            Arc::clone(&events) as _,
            &config,
        ));

        // A two-step run: tool then llm
        let run = Run::new(TenantId::new(), Uuid::new_v4(), 10_000, 2);
        let steps = vec![
            Step::new(
                run.id,
                "fetch",
                WorkUnit::Tool {
                    tool: "browser".to_string(),
                    params: serde_json::json!({}),
                    timeout_seconds: None,
                },
                0,
            ),
            Step::new(
                run.id,
                "summarize",
                WorkUnit::Llm {
                    model: "gpt-4".to_string(),
                    prompt: "Summarize".to_string(),
                    system_prompt: None,
                    max_tokens: Some(100),
                    temperature: None,
                },
                1,
            ),
        ];
        state.insert_run(run.clone(), steps.clone());
        queue
            .send(
                conductor_core::StepMessage::first_attempt(run.id, steps[0].id).to_body(),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let worker = Worker::new(Arc::clone(&queue) as _, executor, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

        // Wait for the run to settle, then stop the worker
        for _ in 0..100 {
            if state.run(run.id).unwrap().status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(state.run(run.id).unwrap().status, RunStatus::Completed);
        assert_eq!(queue.depth(), 0);
        assert_eq!(events.llm_calls().len(), 1);
    }
}

//! Event sinks for the audit trail and progress events.
//!
//! The gateway emits one [`LlmCallEvent`] per attempted provider call; the
//! executor emits one [`StepProgressEvent`] per step status transition.
//! Records are append-only; a sink never mutates or re-reads them.

use parking_lot::Mutex;

use conductor_core::{LlmCallEvent, StepProgressEvent};

/// Destination for audit and progress records.
///
/// The external metrics collaborator subscribes through this seam. Sinks
/// must be cheap and non-blocking; heavy delivery belongs behind a channel
/// inside the implementation.
pub trait EventSink: Send + Sync {
    fn llm_call(&self, event: &LlmCallEvent);
    fn step_progress(&self, event: &StepProgressEvent);
}

/// Sink that emits structured tracing events.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn llm_call(&self, event: &LlmCallEvent) {
        tracing::info!(
            run_id = %event.run_id,
            step_id = %event.step_id,
            provider = %event.provider,
            model = %event.model,
            total_tokens = event.total_tokens,
            cost_usd = event.cost_usd,
            latency_ms = event.latency_ms,
            is_fallback = event.is_fallback,
            success = event.outcome.is_success(),
            "llm_call"
        );
    }

    fn step_progress(&self, event: &StepProgressEvent) {
        tracing::info!(
            run_id = %event.run_id,
            step_id = %event.step_id,
            step_name = %event.step_name,
            to = %event.to,
            attempt = event.attempt,
            "step_progress"
        );
    }
}

/// Collecting sink for tests.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    llm_calls: Mutex<Vec<LlmCallEvent>>,
    progress: Mutex<Vec<StepProgressEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn llm_calls(&self) -> Vec<LlmCallEvent> {
        self.llm_calls.lock().clone()
    }

    pub fn progress_events(&self) -> Vec<StepProgressEvent> {
        self.progress.lock().clone()
    }
}

impl EventSink for MemoryEventSink {
    fn llm_call(&self, event: &LlmCallEvent) {
        self.llm_calls.lock().push(event.clone());
    }

    fn step_progress(&self, event: &StepProgressEvent) {
        self.progress.lock().push(event.clone());
    }
}

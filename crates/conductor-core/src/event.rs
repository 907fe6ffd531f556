//! Append-only audit records.
//!
//! `LlmCallEvent` captures every attempted model call, including failed and
//! failover attempts; `StepProgressEvent` captures every step status
//! transition. Sinks only ever append these; nothing mutates them after
//! creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{RunId, StepId, TenantId};
use crate::status::StepStatus;

/// Outcome of one attempted provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum CallOutcome {
    Success,
    Failed(String),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success)
    }
}

/// Immutable audit record of one attempted model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallEvent {
    pub id: Uuid,
    pub run_id: RunId,
    pub step_id: StepId,
    pub tenant_id: TenantId,

    pub provider: String,
    pub model: String,

    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,

    pub outcome: CallOutcome,

    /// True when this call went to a provider other than the first one
    /// attempted for the request.
    pub is_fallback: bool,
    /// The provider attempted immediately before this one, when failing over.
    pub previous_provider: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl LlmCallEvent {
    /// Start a record for a call about to be attempted.
    pub fn for_attempt(
        run_id: RunId,
        step_id: StepId,
        tenant_id: TenantId,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_id,
            tenant_id,
            provider: provider.into(),
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            outcome: CallOutcome::Success,
            is_fallback: false,
            previous_provider: None,
            created_at: Utc::now(),
        }
    }
}

/// One step status transition, emitted for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgressEvent {
    pub run_id: RunId,
    pub step_id: StepId,
    pub step_name: String,
    pub from: Option<StepStatus>,
    pub to: StepStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl StepProgressEvent {
    pub fn new(
        run_id: RunId,
        step_id: StepId,
        step_name: impl Into<String>,
        from: Option<StepStatus>,
        to: StepStatus,
        attempt: u32,
    ) -> Self {
        Self {
            run_id,
            step_id,
            step_name: step_name.into(),
            from,
            to,
            attempt,
            at: Utc::now(),
        }
    }
}

//! The step record: one unit of work within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ids::{RunId, StepId};
use crate::status::StepStatus;

/// The work a step performs.
///
/// Closed enum: the executor dispatches on the variant, so an unknown step
/// type is a deserialization error at planning time, not a runtime surprise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkUnit {
    /// A governed model call through the LLM gateway.
    Llm {
        model: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
    },
    /// A call into the external sandboxed tool runtime.
    Tool {
        tool: String,
        #[serde(default)]
        params: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
}

impl WorkUnit {
    /// Short label for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkUnit::Llm { .. } => "llm",
            WorkUnit::Tool { .. } => "tool",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

/// One unit of work within a run.
///
/// Created when the run is planned; mutated only by the executor holding the
/// corresponding queue message, always through conditional updates keyed on
/// `(id, attempt)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub run_id: RunId,

    pub name: String,
    pub work: WorkUnit,
    /// Position within the run; steps execute strictly in this order.
    pub order: u32,

    pub status: StepStatus,
    /// Attempt currently in flight or next to run, starting at 1.
    pub attempt: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Critical steps fail the run; non-critical failures let it proceed.
    #[serde(default = "default_true")]
    pub critical: bool,

    #[serde(default)]
    pub input: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub tokens_used: u64,
    pub cost_usd: f64,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Create a queued step awaiting its first attempt.
    pub fn new(run_id: RunId, name: impl Into<String>, work: WorkUnit, order: u32) -> Self {
        Self {
            id: StepId::new(),
            run_id,
            name: name.into(),
            work,
            order,
            status: StepStatus::Queued,
            attempt: 1,
            max_attempts: default_max_attempts(),
            critical: true,
            input: JsonValue::Null,
            output: None,
            error_message: None,
            tokens_used: 0,
            cost_usd: 0.0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder-style override of the retry ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder-style critical flag.
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Attempts remaining after the current one.
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Duration between start and completion, once both are recorded.
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

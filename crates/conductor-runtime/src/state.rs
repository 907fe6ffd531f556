//! Persisted run/step state behind conditional updates.
//!
//! Any storage engine with atomic conditional updates satisfies this trait.
//! Every step mutation is keyed on `(step_id, expected_attempt)`: of two
//! racing deliveries of the same message, exactly one commits and the other
//! observes `Stale`. The persisted record is authoritative over anything a
//! message claims.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use thiserror::Error;

use conductor_core::{Run, RunId, RunStatus, Step, StepId, StepStatus};

/// Errors from the state store.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("step not found: {0}")]
    StepNotFound(StepId),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of attempting to claim a step for execution.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The claim committed; the step is now `running`.
    Claimed(Step),
    /// The persisted record disagrees with the message; drop the delivery.
    Stale {
        persisted_status: StepStatus,
        persisted_attempt: u32,
    },
}

/// Terminal patch applied when a step finishes.
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub status: StepStatus,
    pub output: Option<JsonValue>,
    pub error_message: Option<String>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub completed_at: DateTime<Utc>,
}

/// What advancing the run pointer revealed.
#[derive(Debug, Clone)]
pub enum RunProgress {
    /// The run has another step; its record is returned for dispatch.
    Next(Step),
    /// That was the last step; the run is complete.
    Finished,
}

/// Persistence seam for runs and steps.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_run(&self, id: RunId) -> Result<Option<Run>, StateError>;

    async fn load_step(&self, id: StepId) -> Result<Option<Step>, StateError>;

    /// Conditionally transition a step to `running`.
    ///
    /// Commits only if the persisted status is `queued` and the persisted
    /// attempt equals `expected_attempt`; otherwise reports `Stale`.
    async fn claim_step(
        &self,
        id: StepId,
        expected_attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StateError>;

    /// Conditionally settle a running step. Returns false if the persisted
    /// `(status, attempt)` no longer matches (a racing writer won).
    async fn finish_step(
        &self,
        id: StepId,
        expected_attempt: u32,
        completion: StepCompletion,
    ) -> Result<bool, StateError>;

    /// Conditionally move a running step through `retrying` back to
    /// `queued` with the next attempt number. Returns false on a lost race.
    async fn requeue_step(
        &self,
        id: StepId,
        expected_attempt: u32,
        error_message: String,
    ) -> Result<bool, StateError>;

    /// Add settled usage to the run's counters.
    async fn record_run_usage(
        &self,
        id: RunId,
        tokens: u64,
        cost_usd: f64,
    ) -> Result<(), StateError>;

    /// Set a run's status (and optionally its terminal error).
    async fn set_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<(), StateError>;

    /// Advance the run's `current_step` pointer past `completed_order`.
    ///
    /// Only the executor that completed step N calls this, so the pointer
    /// moves exactly once per step.
    async fn advance_run_step(
        &self,
        id: RunId,
        completed_order: u32,
    ) -> Result<RunProgress, StateError>;
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<RunId, Run>,
    steps: HashMap<StepId, Step>,
}

/// In-memory state store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    state: RwLock<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a run and its planned steps. Run creation belongs to the
    /// control plane; this stands in for it.
    pub fn insert_run(&self, run: Run, steps: Vec<Step>) {
        let mut state = self.state.write();
        for step in steps {
            state.steps.insert(step.id, step);
        }
        state.runs.insert(run.id, run);
    }

    /// Read a step without going through the trait. Test hook.
    pub fn step(&self, id: StepId) -> Option<Step> {
        self.state.read().steps.get(&id).cloned()
    }

    /// Read a run without going through the trait. Test hook.
    pub fn run(&self, id: RunId) -> Option<Run> {
        self.state.read().runs.get(&id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_run(&self, id: RunId) -> Result<Option<Run>, StateError> {
        Ok(self.state.read().runs.get(&id).cloned())
    }

    async fn load_step(&self, id: StepId) -> Result<Option<Step>, StateError> {
        Ok(self.state.read().steps.get(&id).cloned())
    }

    async fn claim_step(
        &self,
        id: StepId,
        expected_attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StateError> {
        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&id)
            .ok_or(StateError::StepNotFound(id))?;

        if step.status != StepStatus::Queued || step.attempt != expected_attempt {
            return Ok(ClaimOutcome::Stale {
                persisted_status: step.status,
                persisted_attempt: step.attempt,
            });
        }

        step.status = StepStatus::Running;
        step.started_at = Some(started_at);
        Ok(ClaimOutcome::Claimed(step.clone()))
    }

    async fn finish_step(
        &self,
        id: StepId,
        expected_attempt: u32,
        completion: StepCompletion,
    ) -> Result<bool, StateError> {
        if !StepStatus::Running.can_transition_to(completion.status) {
            return Err(StateError::IllegalTransition(format!(
                "running -> {}",
                completion.status
            )));
        }

        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&id)
            .ok_or(StateError::StepNotFound(id))?;

        if step.status != StepStatus::Running || step.attempt != expected_attempt {
            return Ok(false);
        }

        step.status = completion.status;
        step.output = completion.output;
        step.error_message = completion.error_message;
        step.tokens_used = completion.tokens_used;
        step.cost_usd = completion.cost_usd;
        step.completed_at = Some(completion.completed_at);
        Ok(true)
    }

    async fn requeue_step(
        &self,
        id: StepId,
        expected_attempt: u32,
        error_message: String,
    ) -> Result<bool, StateError> {
        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&id)
            .ok_or(StateError::StepNotFound(id))?;

        if step.status != StepStatus::Running || step.attempt != expected_attempt {
            return Ok(false);
        }

        // running -> retrying -> queued, committed as one update; `retrying`
        // never rests in the store.
        step.status = StepStatus::Queued;
        step.attempt = expected_attempt + 1;
        step.error_message = Some(error_message);
        step.started_at = None;
        Ok(true)
    }

    async fn record_run_usage(
        &self,
        id: RunId,
        tokens: u64,
        cost_usd: f64,
    ) -> Result<(), StateError> {
        let mut state = self.state.write();
        let run = state.runs.get_mut(&id).ok_or(StateError::RunNotFound(id))?;
        run.tokens_used = run.tokens_used.saturating_add(tokens);
        run.estimated_cost_usd += cost_usd;
        Ok(())
    }

    async fn set_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<(), StateError> {
        let mut state = self.state.write();
        let run = state.runs.get_mut(&id).ok_or(StateError::RunNotFound(id))?;

        if !run.status.can_transition_to(status) {
            return Err(StateError::IllegalTransition(format!(
                "{} -> {}",
                run.status, status
            )));
        }
        run.status = status;
        if error_message.is_some() {
            run.error_message = error_message;
        }
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn advance_run_step(
        &self,
        id: RunId,
        completed_order: u32,
    ) -> Result<RunProgress, StateError> {
        let mut state = self.state.write();
        let run = state.runs.get_mut(&id).ok_or(StateError::RunNotFound(id))?;

        let next_order = completed_order + 1;
        run.current_step = next_order;

        if next_order >= run.total_steps {
            return Ok(RunProgress::Finished);
        }

        let next = state
            .steps
            .values()
            .find(|s| s.run_id == id && s.order == next_order)
            .cloned();
        match next {
            Some(step) => Ok(RunProgress::Next(step)),
            // Planned count says there is a next step but none is stored
            None => Err(StateError::Unavailable(format!(
                "run {id} has no step at order {next_order}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{TenantId, WorkUnit};
    use uuid::Uuid;

    fn tool_work() -> WorkUnit {
        WorkUnit::Tool {
            tool: "browser".to_string(),
            params: serde_json::json!({}),
            timeout_seconds: None,
        }
    }

    fn seed(store: &MemoryStateStore, steps: u32) -> (Run, Vec<Step>) {
        let run = Run::new(TenantId::new(), Uuid::new_v4(), 10_000, steps);
        let planned: Vec<Step> = (0..steps)
            .map(|i| Step::new(run.id, format!("step-{i}"), tool_work(), i))
            .collect();
        store.insert_run(run.clone(), planned.clone());
        (run, planned)
    }

    #[tokio::test]
    async fn duplicate_claim_commits_exactly_once() {
        let store = MemoryStateStore::new();
        let (_, steps) = seed(&store, 1);
        let step_id = steps[0].id;

        let first = store.claim_step(step_id, 1, Utc::now()).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));

        let second = store.claim_step(step_id, 1, Utc::now()).await.unwrap();
        match second {
            ClaimOutcome::Stale {
                persisted_status, ..
            } => assert_eq!(persisted_status, StepStatus::Running),
            ClaimOutcome::Claimed(_) => panic!("duplicate claim must not commit"),
        }
    }

    #[tokio::test]
    async fn mismatched_attempt_is_stale() {
        let store = MemoryStateStore::new();
        let (_, steps) = seed(&store, 1);

        let outcome = store.claim_step(steps[0].id, 3, Utc::now()).await.unwrap();
        assert!(matches!(
            outcome,
            ClaimOutcome::Stale {
                persisted_attempt: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn requeue_bumps_attempt_and_resets_to_queued() {
        let store = MemoryStateStore::new();
        let (_, steps) = seed(&store, 1);
        let step_id = steps[0].id;

        store.claim_step(step_id, 1, Utc::now()).await.unwrap();
        assert!(store
            .requeue_step(step_id, 1, "timeout".to_string())
            .await
            .unwrap());

        let step = store.step(step_id).unwrap();
        assert_eq!(step.status, StepStatus::Queued);
        assert_eq!(step.attempt, 2);
        assert_eq!(step.error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn finish_step_loses_race_after_requeue() {
        let store = MemoryStateStore::new();
        let (_, steps) = seed(&store, 1);
        let step_id = steps[0].id;

        store.claim_step(step_id, 1, Utc::now()).await.unwrap();
        store
            .requeue_step(step_id, 1, "timeout".to_string())
            .await
            .unwrap();

        // A straggler still holding attempt 1 cannot settle
        let committed = store
            .finish_step(
                step_id,
                1,
                StepCompletion {
                    status: StepStatus::Success,
                    output: None,
                    error_message: None,
                    tokens_used: 0,
                    cost_usd: 0.0,
                    completed_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(!committed);
    }

    #[tokio::test]
    async fn advance_walks_steps_then_finishes() {
        let store = MemoryStateStore::new();
        let (run, _) = seed(&store, 2);

        match store.advance_run_step(run.id, 0).await.unwrap() {
            RunProgress::Next(step) => assert_eq!(step.order, 1),
            RunProgress::Finished => panic!("expected a next step"),
        }
        assert!(matches!(
            store.advance_run_step(run.id, 1).await.unwrap(),
            RunProgress::Finished
        ));
        assert_eq!(store.run(run.id).unwrap().current_step, 2);
    }

    #[tokio::test]
    async fn illegal_run_transition_rejected() {
        let store = MemoryStateStore::new();
        let (run, _) = seed(&store, 1);

        store
            .set_run_status(run.id, RunStatus::Completed, None)
            .await
            .unwrap();
        let err = store
            .set_run_status(run.id, RunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition(_)));
    }
}

//! The run record: one execution instance of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{RunId, TenantId, UserId};
use crate::status::RunStatus;

/// One execution instance of a task.
///
/// Created by the control plane; mutated only by the step executor that
/// holds the corresponding queue message. `token_budget` is an immutable
/// ceiling; `tokens_used` is monotonically non-decreasing and the budget
/// ledger guarantees `tokens_used <= token_budget` at the moment a call is
/// authorized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub task_id: Uuid,
    pub created_by: Option<UserId>,

    pub status: RunStatus,
    pub error_message: Option<String>,

    /// Immutable token ceiling for the whole run.
    pub token_budget: u64,
    /// Tokens consumed so far, settled by the budget ledger.
    pub tokens_used: u64,
    /// Accumulated provider cost.
    pub estimated_cost_usd: f64,

    /// Order index of the step currently eligible to execute.
    pub current_step: u32,
    /// Number of planned steps.
    pub total_steps: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new run in `Running` state, ready for its first step.
    ///
    /// Run creation normally happens in the control plane; this constructor
    /// exists for the in-memory store and tests.
    pub fn new(tenant_id: TenantId, task_id: Uuid, token_budget: u64, total_steps: u32) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            tenant_id,
            task_id,
            created_by: None,
            status: RunStatus::Running,
            error_message: None,
            token_budget,
            tokens_used: 0,
            estimated_cost_usd: 0.0,
            current_step: 0,
            total_steps,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    /// Tokens still available under the budget ceiling.
    pub fn remaining_budget(&self) -> u64 {
        self.token_budget.saturating_sub(self.tokens_used)
    }

    /// Whether `order` is the last planned step.
    pub fn is_last_step(&self, order: u32) -> bool {
        order + 1 >= self.total_steps
    }

    /// Wall-clock duration, once both endpoints are known.
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_budget_saturates() {
        let mut run = Run::new(TenantId::new(), Uuid::new_v4(), 100, 3);
        assert_eq!(run.remaining_budget(), 100);

        run.tokens_used = 40;
        assert_eq!(run.remaining_budget(), 60);

        // Post-hoc overage from actual-vs-estimate drift
        run.tokens_used = 120;
        assert_eq!(run.remaining_budget(), 0);
    }

    #[test]
    fn last_step_detection() {
        let run = Run::new(TenantId::new(), Uuid::new_v4(), 100, 3);
        assert!(!run.is_last_step(0));
        assert!(!run.is_last_step(1));
        assert!(run.is_last_step(2));
    }
}

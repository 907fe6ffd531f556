//! Run and step status state machines.
//!
//! Both enums are closed: the legal transitions are encoded here and the
//! stores reject anything else at write time. The reference schema keeps
//! these as text columns with check constraints; in Rust they are proper
//! variants so an illegal state cannot be constructed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet picked up.
    Pending,
    /// Steps are being executed.
    Running,
    /// All steps reached `success` (or were non-critical failures).
    Completed,
    /// A critical step failed terminally.
    Failed,
    /// Terminal failure whose cause was the token budget.
    BudgetExceeded,
    /// Cancelled externally; in-flight steps drain without retrying.
    Cancelled,
}

impl RunStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::BudgetExceeded
                | RunStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor state.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Completed)
            | (Running, Failed)
            | (Running, BudgetExceeded)
            | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::BudgetExceeded => "budget_exceeded",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a step.
///
/// `Retrying` is transient: the executor writes it, immediately re-enqueues
/// with a delay, and flips the record back to `Queued`. It never persists as
/// a resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Retrying,
    Success,
    Failed,
    Cancelled,
}

impl StepStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor state.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Success) | (Running, Retrying) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Retrying, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_terminal_states_have_no_successors() {
        for terminal in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::BudgetExceeded,
            RunStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::BudgetExceeded,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn step_retry_cycle_is_legal() {
        assert!(StepStatus::Queued.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Retrying));
        assert!(StepStatus::Retrying.can_transition_to(StepStatus::Queued));
    }

    #[test]
    fn step_cannot_skip_running() {
        assert!(!StepStatus::Queued.can_transition_to(StepStatus::Success));
        assert!(!StepStatus::Queued.can_transition_to(StepStatus::Failed));
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::BudgetExceeded).unwrap(),
            "\"budget_exceeded\""
        );
        assert_eq!(
            serde_json::to_string(&StepStatus::Retrying).unwrap(),
            "\"retrying\""
        );
    }
}

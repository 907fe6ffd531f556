//! The queue message that drives the step executor.
//!
//! One message means "attempt number `attempt` of step `step_id` is eligible
//! to run". Delivery is at-least-once, so the persisted step record — not
//! the message — is authoritative for the attempt counter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{RunId, StepId};

/// Errors decoding a queue message body.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Body of one step-execution message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMessage {
    pub run_id: RunId,
    pub step_id: StepId,
    /// Attempt this delivery is for, starting at 1.
    pub attempt: u32,
}

impl StepMessage {
    /// Message for the first attempt of a step.
    pub fn first_attempt(run_id: RunId, step_id: StepId) -> Self {
        Self {
            run_id,
            step_id,
            attempt: 1,
        }
    }

    /// The follow-up message sent when this attempt is retried.
    pub fn next_attempt(&self) -> Self {
        Self {
            run_id: self.run_id,
            step_id: self.step_id,
            attempt: self.attempt + 1,
        }
    }

    /// Serialize to a queue body.
    pub fn to_body(&self) -> String {
        // StepMessage contains only map-safe fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse from a queue body.
    pub fn from_body(body: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(body)?)
    }
}

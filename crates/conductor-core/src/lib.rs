//! # conductor-core
//!
//! Domain model for the Conductor execution core.
//!
//! This crate defines the records and state machines shared by the step
//! executor and the LLM gateway:
//! - Strongly-typed identifiers for runs, steps, tenants, and users
//! - `Run` and `Step` records with closed status enums
//! - The queue message format delivered to workers
//! - The retry backoff policy (delay is data attached to a re-sent message,
//!   never an in-process timer)
//! - The classified failure taxonomy that drives retry decisions
//! - Append-only audit event records
//!
//! Everything here is synchronous and I/O-free. The runtime crate owns
//! queues, stores, providers, and the async machinery around them.

pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod retry;
pub mod run;
pub mod status;
pub mod step;

// Re-export main types at crate root
pub use error::{ExecutionError, RetryClass};
pub use event::{CallOutcome, LlmCallEvent, StepProgressEvent};
pub use ids::{RunId, StepId, TenantId, UserId};
pub use message::{MessageError, StepMessage};
pub use retry::BackoffPolicy;
pub use run::Run;
pub use status::{RunStatus, StepStatus};
pub use step::{Step, WorkUnit};

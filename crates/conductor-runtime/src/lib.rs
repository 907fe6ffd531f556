//! # conductor-runtime
//!
//! The governance core of the Conductor platform: a step execution loop
//! coupled to an LLM gateway that enforces token budgets, rate limits, and
//! per-provider circuit breaking on every outbound model call.
//!
//! ## Architecture
//!
//! ```text
//! QueueAdapter -> Worker -> StepExecutor -> LlmGateway -> { BudgetLedger,
//!                                        \                 RateLimiter,
//!                                         -> ToolRuntime   BreakerRegistry,
//!                                                          LlmProvider }
//! ```
//!
//! Cross-worker state (budget counters, rate windows, breaker records) lives
//! behind the [`governance::GovernanceStore`] trait: every operation is a
//! single-round atomic update, so many worker processes can share one store
//! without long-held locks. Step retry is data — a delay attached to the
//! re-sent queue message — never an in-process timer.
//!
//! HTTP provider implementations are feature-gated (`anthropic`, `openai`,
//! `local`); the default build carries only the traits and in-memory
//! implementations, which is enough to run and test the whole governed
//! pipeline.

pub mod cache;
pub mod config;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod governance;
pub mod providers;
pub mod queue;
pub mod state;
pub mod tools;
pub mod worker;

pub use cache::CompletionCache;
pub use config::RuntimeConfig;
pub use events::{EventSink, MemoryEventSink, TracingEventSink};
pub use executor::{Disposition, StepExecutor};
pub use gateway::{CompletionRequest, GatewayError, GatewayResponse, LlmGateway};
pub use governance::{
    BreakerRegistry, BudgetLedger, GovernanceStore, MemoryGovernanceStore, RateLimiter,
};
pub use queue::{InMemoryQueue, QueueAdapter, QueueError, QueueMessage};
pub use state::{MemoryStateStore, StateError, StateStore};
pub use tools::{ToolOutcome, ToolRequest, ToolRuntime};
pub use worker::Worker;

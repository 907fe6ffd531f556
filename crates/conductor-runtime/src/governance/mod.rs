//! Governance primitives shared by every worker.
//!
//! The budget ledger, rate limiter, and circuit breaker registry are
//! front-ends over one narrow store interface. Workers hold no governance
//! state of their own: a reservation, a window increment, or a breaker
//! transition is always a single atomic operation against the shared store.

pub mod budget;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod store;

pub use budget::{BudgetError, BudgetLedger, Reservation, Settlement};
pub use circuit_breaker::{Admission, BreakerRecord, BreakerRegistry, BreakerState};
pub use rate_limit::{RateDecision, RateLimiter, RateScope};
pub use store::{
    with_store_timeout, CounterUpdate, GovernanceStore, MemoryGovernanceStore, StoreError,
    VersionedBreaker, WindowCount,
};

//! Narrow interface over the shared governance store.
//!
//! Budget counters, rate windows, and breaker records are the only
//! cross-worker mutable state in the system. Workers never read-then-write
//! them from application code: every operation here is a single-round atomic
//! update the backing store executes on their behalf (Redis scripts, SQL
//! conditional updates, or the in-memory implementation's lock).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use super::circuit_breaker::BreakerRecord;

/// Errors from the governance store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of a ceiling-checked counter add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// The add was applied; carries the new value.
    Applied { value: u64 },
    /// The add would have exceeded the ceiling; nothing changed.
    Refused { current: u64 },
}

/// Counter state for one rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCount {
    /// Requests counted in the current window, including this one.
    pub count: u64,
    /// Inclusive start of the window.
    pub window_start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub window_end: DateTime<Utc>,
}

/// A breaker record paired with its CAS version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedBreaker {
    /// Monotonic version; 0 means "record absent".
    pub version: u64,
    pub record: BreakerRecord,
}

/// Atomic operations the governance components are built on.
///
/// Implementations must make each method a linearizable operation: two
/// concurrent calls observe each other's effects, and no method is ever a
/// read-modify-write split across the wire.
#[async_trait]
pub trait GovernanceStore: Send + Sync {
    /// Add `delta` to `key` unless the result would exceed `ceiling`.
    async fn counter_check_add(
        &self,
        key: &str,
        delta: u64,
        ceiling: u64,
    ) -> Result<CounterUpdate, StoreError>;

    /// Unconditional signed add, floored at zero. Returns the new value.
    async fn counter_add(&self, key: &str, delta: i64) -> Result<u64, StoreError>;

    /// Read a counter (0 if absent).
    async fn counter_get(&self, key: &str) -> Result<u64, StoreError>;

    /// Settle a reservation: apply `delta` to the run counter and add
    /// `tenant_delta` to the tenant's monthly counter in one atomic step.
    /// Returns `(run_value, tenant_value)`.
    async fn counter_reconcile(
        &self,
        run_key: &str,
        tenant_key: &str,
        delta: i64,
        tenant_delta: u64,
    ) -> Result<(u64, u64), StoreError>;

    /// Increment the counter for the window containing `now`. Rolling into a
    /// new window resets the count; the rollover decision and the increment
    /// are one atomic step.
    async fn window_incr(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError>;

    /// Load the breaker record for a provider, if any.
    async fn breaker_get(&self, provider: &str) -> Result<Option<VersionedBreaker>, StoreError>;

    /// Store `next` only if the current version matches `expected_version`
    /// (0 = insert-if-absent). Returns whether the swap was applied.
    async fn breaker_cas(
        &self,
        provider: &str,
        expected_version: u64,
        next: BreakerRecord,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    counters: HashMap<String, u64>,
    windows: HashMap<String, WindowCount>,
    breakers: HashMap<String, VersionedBreaker>,
}

/// In-memory governance store.
///
/// Backs tests and single-node deployments. One lock covers all three maps
/// so every trait method is atomic exactly as the contract requires; a
/// multi-worker deployment swaps this for a store process with the same
/// per-operation semantics.
#[derive(Default)]
pub struct MemoryGovernanceStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryGovernanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[async_trait]
impl GovernanceStore for MemoryGovernanceStore {
    async fn counter_check_add(
        &self,
        key: &str,
        delta: u64,
        ceiling: u64,
    ) -> Result<CounterUpdate, StoreError> {
        let mut inner = self.inner.lock();
        let current = inner.counters.get(key).copied().unwrap_or(0);
        match current.checked_add(delta) {
            Some(next) if next <= ceiling => {
                inner.counters.insert(key.to_string(), next);
                Ok(CounterUpdate::Applied { value: next })
            }
            _ => Ok(CounterUpdate::Refused { current }),
        }
    }

    async fn counter_add(&self, key: &str, delta: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let current = inner.counters.get(key).copied().unwrap_or(0);
        let next = apply_signed(current, delta);
        inner.counters.insert(key.to_string(), next);
        Ok(next)
    }

    async fn counter_get(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.inner.lock().counters.get(key).copied().unwrap_or(0))
    }

    async fn counter_reconcile(
        &self,
        run_key: &str,
        tenant_key: &str,
        delta: i64,
        tenant_delta: u64,
    ) -> Result<(u64, u64), StoreError> {
        let mut inner = self.inner.lock();

        let run_current = inner.counters.get(run_key).copied().unwrap_or(0);
        let run_next = apply_signed(run_current, delta);
        inner.counters.insert(run_key.to_string(), run_next);

        let tenant_current = inner.counters.get(tenant_key).copied().unwrap_or(0);
        let tenant_next = tenant_current.saturating_add(tenant_delta);
        inner.counters.insert(tenant_key.to_string(), tenant_next);

        Ok((run_next, tenant_next))
    }

    async fn window_incr(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError> {
        let mut inner = self.inner.lock();
        let window_len = chrono::Duration::from_std(window)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let entry = inner.windows.get(key).copied();
        let next = match entry {
            Some(current) if now < current.window_end => WindowCount {
                count: current.count + 1,
                ..current
            },
            _ => WindowCount {
                count: 1,
                window_start: now,
                window_end: now + window_len,
            },
        };
        inner.windows.insert(key.to_string(), next);
        Ok(next)
    }

    async fn breaker_get(&self, provider: &str) -> Result<Option<VersionedBreaker>, StoreError> {
        Ok(self.inner.lock().breakers.get(provider).cloned())
    }

    async fn breaker_cas(
        &self,
        provider: &str,
        expected_version: u64,
        next: BreakerRecord,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let current_version = inner.breakers.get(provider).map(|v| v.version).unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        inner.breakers.insert(
            provider.to_string(),
            VersionedBreaker {
                version: current_version + 1,
                record: next,
            },
        );
        Ok(true)
    }
}

/// Bound a store call by the configured store-level timeout.
///
/// A slow ledger must not stall step processing; exceeding the bound is
/// reported as a retryable failure of the governed call.
pub async fn with_store_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

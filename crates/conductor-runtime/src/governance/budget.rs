//! Token budget ledger.
//!
//! The ledger speaks reserve/reconcile/release: an estimate is held against
//! the run's ceiling before any provider call, and the actual usage replaces
//! it afterwards in one atomic store operation that also feeds the tenant's
//! monthly counter. Authorization is always checked against the shared
//! store, never a cached value.

use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use conductor_core::{RunId, TenantId};

use super::store::{with_store_timeout, CounterUpdate, GovernanceStore, StoreError};
use crate::config::BudgetConfig;

/// Errors from the budget ledger.
#[derive(Error, Debug, Clone)]
pub enum BudgetError {
    /// The reservation would exceed the run's ceiling, or a previous breach
    /// was recorded and the policy is lazy detection.
    #[error("token budget exceeded: {used} used of {budget}")]
    Exceeded { used: u64, budget: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A provisional hold against a run's budget.
///
/// Settle with [`BudgetLedger::reconcile`] once actual usage is known, or
/// [`BudgetLedger::release`] if no call was made.
#[derive(Debug, Clone)]
#[must_use = "a reservation must be reconciled or released"]
pub struct Reservation {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub reserved_tokens: u64,
    pub budget: u64,
}

/// Result of settling a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Run usage after settling.
    pub run_tokens_used: u64,
    /// True when actual usage pushed the run past its ceiling. The call
    /// already happened, so it completes; the breach is recorded and trips
    /// the next authorization.
    pub breached: bool,
    /// True when usage crossed the configured soft-limit percentage.
    pub soft_limit_reached: bool,
}

fn run_key(run_id: RunId) -> String {
    format!("budget:run:{run_id}")
}

fn breach_key(run_id: RunId) -> String {
    format!("budget:breach:{run_id}")
}

fn tenant_month_key(tenant_id: TenantId, at: DateTime<Utc>) -> String {
    format!("budget:tenant:{tenant_id}:{:04}-{:02}", at.year(), at.month())
}

/// Per-run token accounting with atomic check-and-reserve semantics.
pub struct BudgetLedger {
    store: Arc<dyn GovernanceStore>,
    config: BudgetConfig,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn GovernanceStore>, config: BudgetConfig) -> Self {
        Self { store, config }
    }

    fn timeout(&self) -> Duration {
        self.config.store_timeout
    }

    /// Reserve `estimated_tokens` against the run's remaining budget.
    ///
    /// Fails without leaving any partial hold if the reservation would
    /// exceed the ceiling, or if a previous settlement recorded a breach.
    pub async fn check_and_reserve(
        &self,
        run_id: RunId,
        tenant_id: TenantId,
        budget: u64,
        estimated_tokens: u64,
    ) -> Result<Reservation, BudgetError> {
        let breached =
            with_store_timeout(self.timeout(), self.store.counter_get(&breach_key(run_id))).await?;
        if breached > 0 {
            let used =
                with_store_timeout(self.timeout(), self.store.counter_get(&run_key(run_id)))
                    .await?;
            return Err(BudgetError::Exceeded { used, budget });
        }

        let update = with_store_timeout(
            self.timeout(),
            self.store
                .counter_check_add(&run_key(run_id), estimated_tokens, budget),
        )
        .await?;

        match update {
            CounterUpdate::Applied { value } => {
                if self.past_soft_limit(value, budget) {
                    tracing::warn!(
                        run_id = %run_id,
                        reserved = value,
                        budget,
                        "run budget soft limit reached"
                    );
                }
                Ok(Reservation {
                    run_id,
                    tenant_id,
                    reserved_tokens: estimated_tokens,
                    budget,
                })
            }
            CounterUpdate::Refused { current } => Err(BudgetError::Exceeded {
                used: current,
                budget,
            }),
        }
    }

    /// Replace the reservation's estimate with actual usage and feed the
    /// tenant's monthly counter, in one atomic store operation.
    ///
    /// Over-estimation is refunded. Under-estimation that pushes the run
    /// past its ceiling is recorded as a breach rather than rolled back:
    /// the tokens are already spent.
    pub async fn reconcile(
        &self,
        reservation: Reservation,
        actual_tokens: u64,
    ) -> Result<Settlement, BudgetError> {
        let delta = actual_tokens as i64 - reservation.reserved_tokens as i64;
        let (run_used, _tenant_used) = with_store_timeout(
            self.timeout(),
            self.store.counter_reconcile(
                &run_key(reservation.run_id),
                &tenant_month_key(reservation.tenant_id, Utc::now()),
                delta,
                actual_tokens,
            ),
        )
        .await?;

        let breached = run_used > reservation.budget;
        if breached {
            with_store_timeout(
                self.timeout(),
                self.store.counter_add(&breach_key(reservation.run_id), 1),
            )
            .await?;
            tracing::warn!(
                run_id = %reservation.run_id,
                used = run_used,
                budget = reservation.budget,
                "actual usage breached run budget"
            );
        }

        Ok(Settlement {
            run_tokens_used: run_used,
            breached,
            soft_limit_reached: self.past_soft_limit(run_used, reservation.budget),
        })
    }

    /// Release an unused reservation in full.
    pub async fn release(&self, reservation: Reservation) -> Result<(), BudgetError> {
        with_store_timeout(
            self.timeout(),
            self.store.counter_add(
                &run_key(reservation.run_id),
                -(reservation.reserved_tokens as i64),
            ),
        )
        .await?;
        Ok(())
    }

    /// Settled usage for a run.
    pub async fn run_usage(&self, run_id: RunId) -> Result<u64, BudgetError> {
        Ok(with_store_timeout(self.timeout(), self.store.counter_get(&run_key(run_id))).await?)
    }

    /// Tenant usage for the month containing `at`.
    pub async fn tenant_usage(
        &self,
        tenant_id: TenantId,
        at: DateTime<Utc>,
    ) -> Result<u64, BudgetError> {
        Ok(with_store_timeout(
            self.timeout(),
            self.store.counter_get(&tenant_month_key(tenant_id, at)),
        )
        .await?)
    }

    fn past_soft_limit(&self, used: u64, budget: u64) -> bool {
        if budget == 0 {
            return true;
        }
        used.saturating_mul(100) / budget >= self.config.soft_limit_percent as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::store::MemoryGovernanceStore;

    fn ledger() -> BudgetLedger {
        BudgetLedger::new(
            Arc::new(MemoryGovernanceStore::new()),
            BudgetConfig::default(),
        )
    }

    #[tokio::test]
    async fn reservation_beyond_budget_fails_cleanly() {
        let ledger = ledger();
        let run = RunId::new();
        let tenant = TenantId::new();

        let err = ledger
            .check_and_reserve(run, tenant, 1000, 1200)
            .await
            .unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { used: 0, budget: 1000 }));

        // Nothing held: a reservation that fits still succeeds in full
        let reservation = ledger
            .check_and_reserve(run, tenant, 1000, 1000)
            .await
            .unwrap();
        assert_eq!(reservation.reserved_tokens, 1000);
    }

    #[tokio::test]
    async fn over_estimation_is_refunded() {
        let ledger = ledger();
        let run = RunId::new();
        let tenant = TenantId::new();

        let reservation = ledger.check_and_reserve(run, tenant, 1000, 600).await.unwrap();
        let settlement = ledger.reconcile(reservation, 250).await.unwrap();

        assert_eq!(settlement.run_tokens_used, 250);
        assert!(!settlement.breached);
        assert_eq!(ledger.run_usage(run).await.unwrap(), 250);
    }

    #[tokio::test]
    async fn under_estimation_breach_is_recorded_not_rolled_back() {
        let ledger = ledger();
        let run = RunId::new();
        let tenant = TenantId::new();

        let reservation = ledger.check_and_reserve(run, tenant, 1000, 400).await.unwrap();
        let settlement = ledger.reconcile(reservation, 1100).await.unwrap();
        assert!(settlement.breached);
        assert_eq!(settlement.run_tokens_used, 1100);

        // Lazy detection: the next authorization fails
        let err = ledger
            .check_and_reserve(run, tenant, 1000, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { .. }));
    }

    #[tokio::test]
    async fn release_returns_the_full_hold() {
        let ledger = ledger();
        let run = RunId::new();
        let tenant = TenantId::new();

        let reservation = ledger.check_and_reserve(run, tenant, 1000, 800).await.unwrap();
        ledger.release(reservation).await.unwrap();
        assert_eq!(ledger.run_usage(run).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tenant_monthly_counter_accumulates() {
        let ledger = ledger();
        let run = RunId::new();
        let tenant = TenantId::new();

        for _ in 0..3 {
            let reservation = ledger.check_and_reserve(run, tenant, 10_000, 100).await.unwrap();
            ledger.reconcile(reservation, 100).await.unwrap();
        }
        assert_eq!(ledger.tenant_usage(tenant, Utc::now()).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn concurrent_reserves_never_authorize_past_budget() {
        let store = Arc::new(MemoryGovernanceStore::new());
        let ledger = Arc::new(BudgetLedger::new(store, BudgetConfig::default()));
        let run = RunId::new();
        let tenant = TenantId::new();
        let budget = 1000u64;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.check_and_reserve(run, tenant, budget, 90).await
            }));
        }

        let mut granted = 0u64;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 90;
            }
        }
        assert!(granted <= budget);
        assert_eq!(ledger.run_usage(run).await.unwrap(), granted);
    }
}

//! Request rate limiting per tenant and per user.
//!
//! Window counters live in the shared store; the decision of which window a
//! request belongs to is made atomically with the increment, so requests
//! never straddle two windows inconsistently. Denied requests still consume
//! a slot (increment-then-compare), keeping the bookkeeping immune to
//! denial storms.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{TenantId, UserId};

use super::store::{with_store_timeout, GovernanceStore, StoreError};
use crate::config::RateLimitConfig;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        /// Requests left in the tightest window.
        remaining: u64,
    },
    Limited {
        /// Which identity's window was exhausted.
        scope: RateScope,
        /// Time until that window resets.
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Identity whose window was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Tenant,
    User,
}

/// Sliding-window request limiter keyed by tenant and user.
pub struct RateLimiter {
    store: Arc<dyn GovernanceStore>,
    config: RateLimitConfig,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        config: RateLimitConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            config,
            store_timeout,
        }
    }

    /// Check both the tenant window and, when a user identity is present,
    /// the user window. Either being exhausted limits the request.
    pub async fn check(
        &self,
        tenant_id: TenantId,
        user_id: Option<UserId>,
    ) -> Result<RateDecision, StoreError> {
        self.check_at(tenant_id, user_id, Utc::now()).await
    }

    /// Check at an explicit instant (tests drive this directly).
    pub async fn check_at(
        &self,
        tenant_id: TenantId,
        user_id: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, StoreError> {
        let tenant = with_store_timeout(
            self.store_timeout,
            self.store
                .window_incr(&format!("rate:tenant:{tenant_id}"), self.config.window, now),
        )
        .await?;

        if tenant.count > self.config.tenant_requests_per_window {
            let decision = RateDecision::Limited {
                scope: RateScope::Tenant,
                retry_after: remaining_window(tenant.window_end, now),
            };
            tracing::warn!(
                tenant_id = %tenant_id,
                count = tenant.count,
                limit = self.config.tenant_requests_per_window,
                "tenant rate limit exceeded"
            );
            return Ok(decision);
        }

        let mut tightest = self
            .config
            .tenant_requests_per_window
            .saturating_sub(tenant.count);

        if let Some(user_id) = user_id {
            let user = with_store_timeout(
                self.store_timeout,
                self.store
                    .window_incr(&format!("rate:user:{user_id}"), self.config.window, now),
            )
            .await?;

            if user.count > self.config.user_requests_per_window {
                tracing::warn!(
                    user_id = %user_id,
                    count = user.count,
                    limit = self.config.user_requests_per_window,
                    "user rate limit exceeded"
                );
                return Ok(RateDecision::Limited {
                    scope: RateScope::User,
                    retry_after: remaining_window(user.window_end, now),
                });
            }
            tightest = tightest.min(
                self.config
                    .user_requests_per_window
                    .saturating_sub(user.count),
            );
        }

        Ok(RateDecision::Allowed { remaining: tightest })
    }
}

fn remaining_window(window_end: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (window_end - now).to_std().unwrap_or(Duration::ZERO)
}

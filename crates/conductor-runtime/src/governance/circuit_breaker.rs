//! Per-provider circuit breakers over the shared store.
//!
//! Every worker process consults the same breaker records, so state lives
//! behind [`GovernanceStore`] and all transitions go through versioned
//! compare-and-swap. The probe admission in half-open is first-claimer-wins:
//! concurrent callers that lose the CAS treat the provider as still open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::store::{GovernanceStore, StoreError, VersionedBreaker};
use crate::config::BreakerConfig;

/// State tag of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls short-circuit until the cooldown elapses.
    Open,
    /// One probe call is permitted; its outcome decides the next state.
    HalfOpen,
}

/// Persisted record for one provider's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub probe_eligible_at: Option<DateTime<Utc>>,
    /// Set while the single half-open probe is out.
    pub probe_in_flight: bool,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            probe_eligible_at: None,
            probe_in_flight: false,
        }
    }
}

/// What the breaker allows for one prospective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed: call normally.
    Allow,
    /// This caller claimed the single half-open probe.
    Probe,
    /// Breaker open (or the probe is already out): skip this provider.
    ShortCircuit,
}

/// Registry of per-provider breakers.
pub struct BreakerRegistry {
    store: Arc<dyn GovernanceStore>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(store: Arc<dyn GovernanceStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    /// Decide admission for one call to `provider`.
    pub async fn admit(&self, provider: &str) -> Result<Admission, StoreError> {
        self.admit_at(provider, Utc::now()).await
    }

    /// Admission decision at an explicit instant (tests drive this directly).
    pub async fn admit_at(
        &self,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<Admission, StoreError> {
        let Some(versioned) = self.store.breaker_get(provider).await? else {
            return Ok(Admission::Allow);
        };
        let record = versioned.record.clone();

        match record.state {
            BreakerState::Closed => Ok(Admission::Allow),
            BreakerState::Open => {
                let eligible = record
                    .probe_eligible_at
                    .map(|at| now >= at)
                    .unwrap_or(true);
                if !eligible {
                    return Ok(Admission::ShortCircuit);
                }
                // Cooldown elapsed: try to claim the half-open probe.
                let mut next = record;
                next.state = BreakerState::HalfOpen;
                next.probe_in_flight = true;
                if self
                    .store
                    .breaker_cas(provider, versioned.version, next)
                    .await?
                {
                    tracing::info!(provider, "breaker half-open, probe dispatched");
                    Ok(Admission::Probe)
                } else {
                    // Someone else claimed it first.
                    Ok(Admission::ShortCircuit)
                }
            }
            BreakerState::HalfOpen => {
                if record.probe_in_flight {
                    return Ok(Admission::ShortCircuit);
                }
                let mut next = record;
                next.probe_in_flight = true;
                if self
                    .store
                    .breaker_cas(provider, versioned.version, next)
                    .await?
                {
                    Ok(Admission::Probe)
                } else {
                    Ok(Admission::ShortCircuit)
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker if it was half-open and
    /// resets the failure counter.
    pub async fn record_success(&self, provider: &str) -> Result<(), StoreError> {
        self.record_success_at(provider, Utc::now()).await
    }

    pub async fn record_success_at(
        &self,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        loop {
            let Some(versioned) = self.store.breaker_get(provider).await? else {
                return Ok(());
            };
            let was_half_open = versioned.record.state == BreakerState::HalfOpen;

            let next = BreakerRecord {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: versioned.record.last_failure_at,
                last_success_at: Some(now),
                opened_at: None,
                probe_eligible_at: None,
                probe_in_flight: false,
            };
            if self
                .store
                .breaker_cas(provider, versioned.version, next)
                .await?
            {
                if was_half_open {
                    tracing::info!(provider, "breaker closed after successful probe");
                }
                return Ok(());
            }
            // Lost a race; re-read and retry.
        }
    }

    /// Record a failed call. Opens the breaker once the consecutive-failure
    /// counter crosses the threshold, or re-opens it after a failed probe.
    pub async fn record_failure(&self, provider: &str) -> Result<(), StoreError> {
        self.record_failure_at(provider, Utc::now()).await
    }

    pub async fn record_failure_at(
        &self,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        loop {
            let (version, record) = match self.store.breaker_get(provider).await? {
                Some(VersionedBreaker { version, record }) => (version, record),
                None => (0, BreakerRecord::default()),
            };

            let failures = record.consecutive_failures + 1;
            let prior_state = record.state;
            let next = match record.state {
                BreakerState::Closed if failures >= self.config.failure_threshold => {
                    self.opened(failures, now)
                }
                BreakerState::Closed => BreakerRecord {
                    state: BreakerState::Closed,
                    consecutive_failures: failures,
                    last_failure_at: Some(now),
                    ..record
                },
                // A failed probe re-opens with a restarted cooldown.
                BreakerState::HalfOpen => self.opened(failures, now),
                // Already open (a straggling in-flight call finished late);
                // keep the open state but note the failure.
                BreakerState::Open => BreakerRecord {
                    consecutive_failures: failures,
                    last_failure_at: Some(now),
                    ..record
                },
            };

            let opened = next.state == BreakerState::Open && prior_state != BreakerState::Open;
            if self.store.breaker_cas(provider, version, next).await? {
                if opened {
                    tracing::warn!(provider, failures, "breaker opened after repeated failures");
                }
                return Ok(());
            }
        }
    }

    /// Current state tag, for health reporting.
    pub async fn state(&self, provider: &str) -> Result<BreakerState, StoreError> {
        Ok(self
            .store
            .breaker_get(provider)
            .await?
            .map(|v| v.record.state)
            .unwrap_or(BreakerState::Closed))
    }

    fn opened(&self, failures: u32, now: DateTime<Utc>) -> BreakerRecord {
        let cooldown = self.cooldown_for(failures);
        BreakerRecord {
            state: BreakerState::Open,
            consecutive_failures: failures,
            last_failure_at: Some(now),
            last_success_at: None,
            opened_at: Some(now),
            probe_eligible_at: chrono::Duration::from_std(cooldown)
                .ok()
                .map(|d| now + d),
            probe_in_flight: false,
        }
    }

    /// Cooldown derived from failure recency: the further past the threshold
    /// the counter is, the longer the provider is left alone. Bounded below
    /// by `min_cooldown` and above by `max_cooldown`.
    fn cooldown_for(&self, failures: u32) -> Duration {
        let over = failures.saturating_sub(self.config.failure_threshold) as u64;
        let scaled = self
            .config
            .min_cooldown
            .saturating_mul(over.saturating_add(1).min(u32::MAX as u64) as u32);
        scaled.min(self.config.max_cooldown).max(self.config.min_cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::store::MemoryGovernanceStore;

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(
            Arc::new(MemoryGovernanceStore::new()),
            BreakerConfig::default(),
        )
    }

    fn registry_with(config: BreakerConfig) -> BreakerRegistry {
        BreakerRegistry::new(Arc::new(MemoryGovernanceStore::new()), config)
    }

    #[tokio::test]
    async fn starts_closed() {
        let registry = registry();
        assert_eq!(registry.admit("openai").await.unwrap(), Admission::Allow);
        assert_eq!(registry.state("openai").await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_exactly_at_threshold() {
        let registry = registry();
        for i in 1..=5u32 {
            registry.record_failure("openai").await.unwrap();
            let state = registry.state("openai").await.unwrap();
            if i < 5 {
                assert_eq!(state, BreakerState::Closed, "failure {i}");
            } else {
                assert_eq!(state, BreakerState::Open, "failure {i}");
            }
        }
        assert_eq!(
            registry.admit("openai").await.unwrap(),
            Admission::ShortCircuit
        );
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let registry = registry();
        for _ in 0..4 {
            registry.record_failure("openai").await.unwrap();
        }
        registry.record_success("openai").await.unwrap();

        // Four more failures do not reach the threshold again
        for _ in 0..4 {
            registry.record_failure("openai").await.unwrap();
        }
        assert_eq!(registry.state("openai").await.unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn exactly_one_probe_past_cooldown() {
        let registry = registry();
        let t0 = Utc::now();
        for _ in 0..5 {
            registry.record_failure_at("openai", t0).await.unwrap();
        }

        let after_cooldown = t0 + chrono::Duration::seconds(31);
        let first = registry.admit_at("openai", after_cooldown).await.unwrap();
        let second = registry.admit_at("openai", after_cooldown).await.unwrap();
        let third = registry.admit_at("openai", after_cooldown).await.unwrap();

        assert_eq!(first, Admission::Probe);
        assert_eq!(second, Admission::ShortCircuit);
        assert_eq!(third, Admission::ShortCircuit);
    }

    #[tokio::test]
    async fn probe_success_closes_probe_failure_reopens() {
        let registry = registry();
        let t0 = Utc::now();
        for _ in 0..5 {
            registry.record_failure_at("openai", t0).await.unwrap();
        }
        let later = t0 + chrono::Duration::seconds(31);

        assert_eq!(
            registry.admit_at("openai", later).await.unwrap(),
            Admission::Probe
        );
        registry.record_failure_at("openai", later).await.unwrap();
        assert_eq!(registry.state("openai").await.unwrap(), BreakerState::Open);

        // Failed probe restarts the cooldown and lengthens it
        assert_eq!(
            registry.admit_at("openai", later).await.unwrap(),
            Admission::ShortCircuit
        );

        let much_later = later + chrono::Duration::seconds(120);
        assert_eq!(
            registry.admit_at("openai", much_later).await.unwrap(),
            Admission::Probe
        );
        registry.record_success_at("openai", much_later).await.unwrap();
        assert_eq!(registry.state("openai").await.unwrap(), BreakerState::Closed);
        assert_eq!(
            registry.admit_at("openai", much_later).await.unwrap(),
            Admission::Allow
        );
    }

    #[tokio::test]
    async fn cooldown_grows_with_repeat_failures_and_is_bounded() {
        let registry = registry_with(BreakerConfig {
            failure_threshold: 2,
            min_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(100),
        });
        assert_eq!(registry.cooldown_for(2), Duration::from_secs(30));
        assert_eq!(registry.cooldown_for(3), Duration::from_secs(60));
        assert_eq!(registry.cooldown_for(4), Duration::from_secs(90));
        // Clamped at max
        assert_eq!(registry.cooldown_for(10), Duration::from_secs(100));
    }

    mod cooldown_props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn cooldown_stays_within_configured_bounds(
                threshold in 1u32..20,
                min_secs in 1u64..120,
                spread in 1u64..10,
                failures in 0u32..1000,
            ) {
                let config = BreakerConfig {
                    failure_threshold: threshold,
                    min_cooldown: Duration::from_secs(min_secs),
                    max_cooldown: Duration::from_secs(min_secs * spread),
                };
                let registry = BreakerRegistry::new(
                    Arc::new(crate::governance::store::MemoryGovernanceStore::new()),
                    config.clone(),
                );
                let cooldown = registry.cooldown_for(failures);
                prop_assert!(cooldown >= config.min_cooldown);
                prop_assert!(cooldown <= config.max_cooldown);
            }
        }
    }

    #[tokio::test]
    async fn providers_are_independent() {
        let registry = registry();
        for _ in 0..5 {
            registry.record_failure("openai").await.unwrap();
        }
        assert_eq!(registry.state("openai").await.unwrap(), BreakerState::Open);
        assert_eq!(
            registry.state("anthropic").await.unwrap(),
            BreakerState::Closed
        );
        assert_eq!(registry.admit("anthropic").await.unwrap(), Admission::Allow);
    }
}

//! Runtime configuration.
//!
//! Serde structs with defaults matching the platform's deployed settings.
//! Durations are written as humantime strings ("30s", "500ms") in YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use conductor_core::BackoffPolicy;

/// Serialize `Duration` as a humantime string ("20s", "500ms").
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub gateway: GatewayConfig,
    pub retry: RetryConfig,
}

impl RuntimeConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be > 0".into()));
        }
        if self.queue.max_messages == 0 {
            return Err(ConfigError::Invalid("queue.max_messages must be > 0".into()));
        }
        if self.gateway.provider_priority.is_empty() {
            return Err(ConfigError::Invalid(
                "gateway.provider_priority must name at least one provider".into(),
            ));
        }
        if self.gateway.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "gateway.circuit_breaker.failure_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identifier included in logs from this worker instance.
    pub worker_id: String,
    /// Maximum in-flight messages processed concurrently.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "conductor-worker-1".to_string(),
            concurrency: 10,
        }
    }
}

/// Queue consumption settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Batch size per receive call.
    pub max_messages: usize,
    /// Long-poll wait per receive call.
    #[serde(with = "duration_str")]
    pub wait_time: Duration,
    /// Time a received message stays invisible to other consumers. Must
    /// exceed the worst-case processing time of one step.
    #[serde(with = "duration_str")]
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Step retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff base, in seconds.
    pub backoff_base_secs: u64,
    /// Backoff cap, in seconds.
    pub backoff_cap_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            backoff_base_secs: policy.base_secs,
            backoff_cap_secs: policy.cap_secs,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base_secs, self.backoff_cap_secs)
    }
}

/// Gateway settings: providers, budget, rate limits, breakers, cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Providers tried in this order; unconfigured entries are skipped at
    /// startup with a warning.
    pub provider_priority: Vec<String>,
    /// Per-provider configuration blocks, keyed by provider type.
    pub providers: serde_json::Map<String, serde_json::Value>,
    /// Hard wall-clock timeout per provider attempt.
    #[serde(with = "duration_str")]
    pub provider_timeout: Duration,
    /// Hard wall-clock timeout per tool execution.
    #[serde(with = "duration_str")]
    pub tool_timeout: Duration,

    pub budget: BudgetConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: BreakerConfig,
    pub cache: CacheConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider_priority: vec![
                "openai".to_string(),
                "anthropic".to_string(),
                "local".to_string(),
            ],
            providers: serde_json::Map::new(),
            provider_timeout: Duration::from_secs(30),
            tool_timeout: Duration::from_secs(60),
            budget: BudgetConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// When a post-call budget breach (actual usage exceeding the reserved
/// estimate) takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachPolicy {
    /// The breach flag trips the next authorization check.
    Lazy,
    /// The response tells the executor to conclude the run immediately.
    Immediate,
}

/// Budget ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Log a warning once a run crosses this percentage of its budget.
    pub soft_limit_percent: u8,
    pub breach_policy: BreachPolicy,
    /// Upper bound on any single governance-store call.
    #[serde(with = "duration_str")]
    pub store_timeout: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            soft_limit_percent: 80,
            breach_policy: BreachPolicy::Lazy,
            store_timeout: Duration::from_millis(500),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tenant_requests_per_window: u64,
    pub user_requests_per_window: u64,
    #[serde(with = "duration_str")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tenant_requests_per_window: 100,
            user_requests_per_window: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Lower bound on the open-state cooldown.
    #[serde(with = "duration_str")]
    pub min_cooldown: Duration,
    /// Upper bound on the open-state cooldown.
    #[serde(with = "duration_str")]
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Completion cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_settings() {
        let config = RuntimeConfig::default();
        assert_eq!(config.worker.concurrency, 10);
        assert_eq!(config.queue.max_messages, 10);
        assert_eq!(config.queue.wait_time, Duration::from_secs(20));
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.gateway.provider_timeout, Duration::from_secs(30));
        assert_eq!(config.gateway.tool_timeout, Duration::from_secs(60));
        assert_eq!(config.gateway.circuit_breaker.failure_threshold, 5);
        assert_eq!(
            config.gateway.circuit_breaker.min_cooldown,
            Duration::from_secs(30)
        );
        assert_eq!(config.gateway.budget.store_timeout, Duration::from_millis(500));
        assert_eq!(config.gateway.budget.breach_policy, BreachPolicy::Lazy);
    }

    #[test]
    fn yaml_roundtrip_with_humantime_durations() {
        let yaml = r#"
worker:
  worker_id: w-7
  concurrency: 4
queue:
  wait_time: 5s
  visibility_timeout: 2m
gateway:
  provider_timeout: 45s
  budget:
    store_timeout: 250ms
    breach_policy: immediate
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.worker.worker_id, "w-7");
        assert_eq!(config.queue.wait_time, Duration::from_secs(5));
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(120));
        assert_eq!(config.gateway.provider_timeout, Duration::from_secs(45));
        assert_eq!(config.gateway.budget.store_timeout, Duration::from_millis(250));
        assert_eq!(config.gateway.budget.breach_policy, BreachPolicy::Immediate);
        // Untouched sections keep their defaults
        assert_eq!(config.queue.max_messages, 10);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let yaml = "worker:\n  concurrency: 0\n";
        assert!(matches!(
            RuntimeConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn empty_provider_priority_rejected() {
        let yaml = "gateway:\n  provider_priority: []\n";
        assert!(RuntimeConfig::from_yaml(yaml).is_err());
    }
}

//! Completion cache.
//!
//! Identical (model, messages) requests within the TTL are served without a
//! provider call. A hit bills no tokens and skips the budget reservation
//! entirely; rate limiting still applies so cached traffic cannot bypass
//! the limiter.

use moka::future::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::config::CacheConfig;
use crate::gateway::GatewayResponse;
use crate::providers::ChatMessage;

/// Cache key: model plus a hash of the full message sequence.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model: String,
    messages_hash: u64,
}

impl CacheKey {
    pub fn new(model: &str, messages: &[ChatMessage]) -> Self {
        let mut hasher = DefaultHasher::new();
        for msg in messages {
            msg.hash(&mut hasher);
        }
        Self {
            model: model.to_string(),
            messages_hash: hasher.finish(),
        }
    }
}

/// Moka-backed cache of gateway responses.
pub struct CompletionCache {
    cache: Cache<CacheKey, GatewayResponse>,
    enabled: bool,
}

impl CompletionCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();
        Self {
            cache,
            enabled: config.enabled,
        }
    }

    /// Look up a cached response. Returns it flagged as cached.
    pub async fn get(&self, key: &CacheKey) -> Option<GatewayResponse> {
        if !self.enabled {
            return None;
        }
        self.cache.get(key).await.map(|mut response| {
            response.cached = true;
            response
        })
    }

    /// Store a successful response.
    pub async fn insert(&self, key: CacheKey, response: GatewayResponse) {
        if self.enabled {
            self.cache.insert(key, response).await;
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for CompletionCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

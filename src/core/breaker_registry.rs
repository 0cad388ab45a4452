//! Keyed collection of circuit breakers.
//!
//! Each proxy owns one registry by default, so a backend reached through both
//! ingress and egress gets two independent breakers. Passing the same
//! `Arc<CircuitBreakerRegistry>` to both proxies makes them share one breaker
//! per canonical target id instead.
use std::sync::Arc;

use scc::HashMap;

use crate::{
    config::models::CircuitBreakerConfig,
    core::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, StateChangeListener},
};

#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
    listener: Option<StateChangeListener>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose breakers all report transitions to `listener`.
    pub fn with_listener(listener: StateChangeListener) -> Self {
        Self {
            breakers: HashMap::new(),
            listener: Some(listener),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Existing breaker for `key`, if one was created.
    pub async fn get(&self, key: &str) -> Option<CircuitBreaker> {
        self.breakers
            .get_async(key)
            .await
            .map(|entry| entry.get().clone())
    }

    /// Breaker for `key`, creating it with `config` when absent. The config of
    /// an existing breaker is left untouched.
    pub async fn get_or_create(&self, key: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(existing) = self.get(key).await {
            return existing;
        }

        let entry = self
            .breakers
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| {
                tracing::debug!(
                    breaker = key,
                    failure_threshold = config.failure_threshold,
                    success_threshold = config.success_threshold,
                    timeout_ms = config.timeout_ms,
                    "Creating circuit breaker"
                );
                CircuitBreaker::builder(key)
                    .config(config)
                    .state_listener(self.listener.clone())
                    .build()
            });
        entry.get().clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Stats for every breaker, sorted by name.
    pub async fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let mut stats = Vec::new();
        let stats_ref = &mut stats;
        self.breakers
            .retain_async(|_, breaker| {
                stats_ref.push(breaker.stats());
                true
            })
            .await;
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Cancel every pending timer and forget all breakers.
    pub async fn dispose_all(&self) {
        self.breakers
            .retain_async(|_, breaker| {
                breaker.dispose();
                false
            })
            .await;
    }
}

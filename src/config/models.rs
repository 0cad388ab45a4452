//! Configuration data structures for meshgate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde‑friendly and include defaults so that minimal configs remain concise.
//! The policy snapshots (`MeshGlobalConfig`, `MeshServiceConfig`) are also the payloads
//! exchanged with a [`ConfigurationManager`](crate::ports::config_manager::ConfigurationManager).
use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

fn default_admin_prefix() -> String {
    "/_mesh".to_string()
}

fn default_true() -> bool {
    true
}

/// Mesh-wide call policy.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MeshGlobalConfig {
    /// Upstream call timeout applied when a service does not override it
    pub default_timeout_ms: u64,
    /// Additional attempts after a failed upstream call
    pub default_retries: u32,
}

impl Default for MeshGlobalConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            default_retries: 0,
        }
    }
}

/// Per-service (or per named egress policy) overrides.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct MeshServiceConfig {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    /// Breaker sizing for breakers created under this service / policy
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub breaker_timeout_ms: Option<u64>,
}

impl MeshServiceConfig {
    /// Effective upstream timeout given the global fallback.
    pub fn effective_timeout(&self, global: &MeshGlobalConfig) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(global.default_timeout_ms))
    }

    /// Effective retry count given the global fallback.
    pub fn effective_retries(&self, global: &MeshGlobalConfig) -> u32 {
        self.retries.unwrap_or(global.default_retries)
    }
}

/// Circuit breaker tunables.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures in CLOSED before opening
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN before closing
    pub success_threshold: u32,
    /// How long OPEN is held before a trial call is allowed
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 10_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Apply the breaker overrides carried by a service policy.
    pub fn overlay(&self, service: &MeshServiceConfig) -> Self {
        Self {
            failure_threshold: service.failure_threshold.unwrap_or(self.failure_threshold),
            success_threshold: service.success_threshold.unwrap_or(self.success_threshold),
            timeout_ms: service.breaker_timeout_ms.unwrap_or(self.timeout_ms),
        }
    }
}

/// Instance selection strategy.
///
/// Deserialization is lenient: an unknown name falls back to `Random`
/// with a warning instead of rejecting the whole configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    WeightedRoundRobin,
}

impl LoadBalanceStrategy {
    /// Parse a strategy name, defaulting to `Random` for anything unrecognised.
    pub fn parse_lenient(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            tracing::warn!(
                strategy = name,
                "Unknown load balancing strategy, falling back to random"
            );
            LoadBalanceStrategy::Random
        })
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "least_connections" => Ok(Self::LeastConnections),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

impl From<String> for LoadBalanceStrategy {
    fn from(value: String) -> Self {
        Self::parse_lenient(&value)
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalanceStrategy,
}

/// Inbound route: a path prefix mapped to an internal service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IngressRoute {
    pub prefix: String,
    pub service_id: String,
    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    /// Restrict the route to a `Host` header value
    #[serde(default)]
    pub host: Option<String>,
    /// Forward only the part of the path after the prefix
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
}

impl IngressRoute {
    pub fn new(prefix: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            service_id: service_id.into(),
            methods: Vec::new(),
            host: None,
            strip_prefix: true,
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Payload used to register (or re-register) a service instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceRegistration {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl InstanceRegistration {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            version: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Stale-instance expiry driven by heartbeats.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Instances whose last heartbeat is older than this are marked DOWN
    pub ttl_secs: u64,
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 30,
            interval_secs: 10,
        }
    }
}

/// Top-level file configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MeshConfig {
    pub listen_addr: String,
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,
    #[serde(default)]
    pub global: MeshGlobalConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub routes: Vec<IngressRoute>,
    #[serde(default)]
    pub services: HashMap<String, MeshServiceConfig>,
    /// Instances registered at startup, keyed by service id
    #[serde(default)]
    pub instances: HashMap<String, Vec<InstanceRegistration>>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Let ingress and egress share one breaker per target id
    #[serde(default)]
    pub share_breakers: bool,
}

impl MeshConfig {
    /// Create a new mesh configuration builder
    pub fn builder() -> MeshConfigBuilder {
        MeshConfigBuilder::default()
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            admin_prefix: default_admin_prefix(),
            global: MeshGlobalConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            routes: Vec::new(),
            services: HashMap::new(),
            instances: HashMap::new(),
            heartbeat: HeartbeatConfig::default(),
            share_breakers: false,
        }
    }
}

/// Builder for MeshConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct MeshConfigBuilder {
    config: MeshConfig,
    listen_addr_set: bool,
}

impl MeshConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self.listen_addr_set = true;
        self
    }

    pub fn admin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.admin_prefix = prefix.into();
        self
    }

    pub fn global(mut self, global: MeshGlobalConfig) -> Self {
        self.config.global = global;
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = breaker;
        self
    }

    pub fn strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.config.load_balancer.strategy = strategy;
        self
    }

    /// Add an ingress route
    pub fn route(mut self, route: IngressRoute) -> Self {
        self.config.routes.push(route);
        self
    }

    pub fn service(mut self, service_id: impl Into<String>, config: MeshServiceConfig) -> Self {
        self.config.services.insert(service_id.into(), config);
        self
    }

    /// Seed an instance registered at startup
    pub fn instance(
        mut self,
        service_id: impl Into<String>,
        registration: InstanceRegistration,
    ) -> Self {
        self.config
            .instances
            .entry(service_id.into())
            .or_default()
            .push(registration);
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    pub fn share_breakers(mut self, share: bool) -> Self {
        self.config.share_breakers = share;
        self
    }

    /// Build the final MeshConfig
    pub fn build(self) -> Result<MeshConfig, String> {
        if !self.listen_addr_set {
            return Err("listen_addr is required".to_string());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_strategy_falls_back_to_random() {
        let cfg: LoadBalancerConfig =
            serde_json::from_str(r#"{ "strategy": "fastest_guess" }"#).unwrap();
        assert_eq!(cfg.strategy, LoadBalanceStrategy::Random);

        let cfg: LoadBalancerConfig =
            serde_json::from_str(r#"{ "strategy": "least_connections" }"#).unwrap();
        assert_eq!(cfg.strategy, LoadBalanceStrategy::LeastConnections);
    }

    #[test]
    fn test_breaker_overlay() {
        let base = CircuitBreakerConfig::default();
        let service = MeshServiceConfig {
            failure_threshold: Some(2),
            breaker_timeout_ms: Some(50),
            ..Default::default()
        };
        let sized = base.overlay(&service);
        assert_eq!(sized.failure_threshold, 2);
        assert_eq!(sized.success_threshold, 2);
        assert_eq!(sized.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_effective_policy_falls_back_to_global() {
        let global = MeshGlobalConfig {
            default_timeout_ms: 750,
            default_retries: 3,
        };
        let service = MeshServiceConfig {
            retries: Some(1),
            ..Default::default()
        };
        assert_eq!(service.effective_timeout(&global), Duration::from_millis(750));
        assert_eq!(service.effective_retries(&global), 1);
    }

    #[test]
    fn test_builder_requires_listen_addr() {
        assert!(MeshConfig::builder().build().is_err());

        let cfg = MeshConfig::builder()
            .listen_addr("0.0.0.0:9000")
            .route(IngressRoute::new("/orders", "orders"))
            .instance("orders", InstanceRegistration::new("o-1", "10.0.0.1", 8080))
            .build()
            .unwrap();
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.instances["orders"].len(), 1);
        assert_eq!(cfg.admin_prefix, "/_mesh");
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use rand::Rng;

use crate::{config::LoadBalanceStrategy, core::registry::ServiceInstance};

/// Cursor key used when the caller gives no service id.
pub const DEFAULT_SELECTION_KEY: &str = "__default__";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// In-flight request counts per physical endpoint (`host:port`).
#[derive(Debug, Default)]
pub struct InFlightCounts {
    counts: Mutex<HashMap<String, usize>>,
}

impl InFlightCounts {
    pub fn get(&self, address: &str) -> usize {
        lock(&self.counts).get(address).copied().unwrap_or(0)
    }

    fn increment(&self, address: &str) {
        *lock(&self.counts).entry(address.to_string()).or_insert(0) += 1;
    }

    fn decrement(&self, address: &str) {
        let mut counts = lock(&self.counts);
        if let Some(count) = counts.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(address);
            }
        }
    }
}

/// Marks one request as in flight against an instance until dropped.
pub struct ConnectionGuard {
    counts: Arc<InFlightCounts>,
    address: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counts.decrement(&self.address);
    }
}

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Pick the index of one candidate. `candidates` is never empty and only
    /// holds UP instances.
    fn select(
        &self,
        candidates: &[ServiceInstance],
        key: &str,
        in_flight: &InFlightCounts,
    ) -> Option<usize>;

    fn kind(&self) -> LoadBalanceStrategy;

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin with one cursor per selection key
#[derive(Default)]
pub struct RoundRobinStrategy {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(
        &self,
        candidates: &[ServiceInstance],
        key: &str,
        _: &InFlightCounts,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursors = lock(&self.cursors);
        let cursor = cursors.entry(key.to_string()).or_insert(0);
        let index = *cursor % candidates.len();
        *cursor = index + 1;
        Some(index)
    }

    fn kind(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::RoundRobin
    }
}

/// Random selection load balancing strategy
#[derive(Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    /// Create a new random selection strategy
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select(&self, candidates: &[ServiceInstance], _: &str, _: &InFlightCounts) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..candidates.len()))
    }

    fn kind(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::Random
    }
}

/// Fewest in-flight requests wins; ties go to the earliest candidate
#[derive(Default)]
pub struct LeastConnectionsStrategy;

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select(
        &self,
        candidates: &[ServiceInstance],
        _: &str,
        in_flight: &InFlightCounts,
    ) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(index, instance)| (in_flight.get(&instance.address()), *index))
            .map(|(index, _)| index)
    }

    fn kind(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::LeastConnections
    }
}

/// Smooth weighted round robin (nginx style), state per selection key.
///
/// Each round every candidate gains its weight; the leader is picked and
/// pays back the total. Weights {5, 1, 1} yield `a a b a c a a`.
#[derive(Default)]
pub struct WeightedRoundRobinStrategy {
    current: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl LoadBalancingStrategy for WeightedRoundRobinStrategy {
    fn select(
        &self,
        candidates: &[ServiceInstance],
        key: &str,
        _: &InFlightCounts,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let mut all = lock(&self.current);
        let weights = all.entry(key.to_string()).or_default();
        // Forget instances that left the candidate set
        weights.retain(|id, _| candidates.iter().any(|c| &c.id == id));

        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (index, instance) in candidates.iter().enumerate() {
            let weight = i64::from(instance.weight.max(1));
            total += weight;
            let current = weights.entry(instance.id.clone()).or_insert(0);
            *current += weight;
            if best.is_none_or(|(_, leader)| *current > leader) {
                best = Some((index, *current));
            }
        }

        let (index, _) = best?;
        if let Some(current) = weights.get_mut(&candidates[index].id) {
            *current -= total;
        }
        Some(index)
    }

    fn kind(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::WeightedRoundRobin
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Create a new load balancing strategy based on configuration
    pub fn create_strategy(strategy: &LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::Random => RandomStrategy::new().boxed(),
            LoadBalanceStrategy::LeastConnections => LeastConnectionsStrategy.boxed(),
            LoadBalanceStrategy::WeightedRoundRobin => {
                WeightedRoundRobinStrategy::default().boxed()
            }
        }
    }
}

/// Optional hints for a selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub service_id: Option<String>,
}

impl SelectionContext {
    pub fn for_service(service_id: impl Into<String>) -> Self {
        Self {
            service_id: Some(service_id.into()),
        }
    }
}

/// Picks one healthy instance per call using a swappable strategy.
pub struct LoadBalancer {
    strategy: RwLock<Box<dyn LoadBalancingStrategy>>,
    in_flight: Arc<InFlightCounts>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalanceStrategy::default())
    }
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy: RwLock::new(LoadBalancerFactory::create_strategy(&strategy)),
            in_flight: Arc::new(InFlightCounts::default()),
        }
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .kind()
    }

    /// Choose one UP instance, or `None` when there is none.
    pub fn select_instance(
        &self,
        instances: &[ServiceInstance],
        context: Option<&SelectionContext>,
    ) -> Option<ServiceInstance> {
        let healthy: Vec<ServiceInstance> =
            instances.iter().filter(|i| i.is_up()).cloned().collect();
        let key = context
            .and_then(|c| c.service_id.as_deref())
            .unwrap_or(DEFAULT_SELECTION_KEY);

        if healthy.is_empty() {
            tracing::warn!(
                key,
                offered = instances.len(),
                "No healthy instances available for selection"
            );
            return None;
        }

        let strategy = self.strategy.read().unwrap_or_else(|p| p.into_inner());
        let index = strategy.select(&healthy, key, &self.in_flight)?;
        let chosen = healthy.into_iter().nth(index)?;
        tracing::debug!(
            key,
            strategy = %strategy.kind(),
            instance_id = %chosen.id,
            "Selected instance"
        );
        Some(chosen)
    }

    /// Switch strategy. All per-key cursors and weights start over.
    pub fn update_strategy(&self, strategy: LoadBalanceStrategy) {
        let mut current = self.strategy.write().unwrap_or_else(|p| p.into_inner());
        tracing::info!(from = %current.kind(), to = %strategy, "Load balancing strategy updated");
        *current = LoadBalancerFactory::create_strategy(&strategy);
    }

    /// Switch strategy by name; unknown names select `Random` with a warning.
    pub fn update_strategy_named(&self, name: &str) {
        self.update_strategy(LoadBalanceStrategy::parse_lenient(name));
    }

    /// Count a request against `instance` until the guard is dropped.
    pub fn track(&self, instance: &ServiceInstance) -> ConnectionGuard {
        let address = instance.address();
        self.in_flight.increment(&address);
        ConnectionGuard {
            counts: self.in_flight.clone(),
            address,
        }
    }

    pub fn in_flight(&self, instance: &ServiceInstance) -> usize {
        self.in_flight.get(&instance.address())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::registry::InstanceStatus;

    fn instance(id: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port,
            version: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            weight: 1,
            last_heartbeat: Utc::now(),
            status: InstanceStatus::Up,
        }
    }

    fn abc() -> Vec<ServiceInstance> {
        vec![instance("A", 1), instance("B", 2), instance("C", 3)]
    }

    fn pick(lb: &LoadBalancer, instances: &[ServiceInstance], ctx: &SelectionContext) -> String {
        lb.select_instance(instances, Some(ctx)).unwrap().id
    }

    #[test]
    fn test_round_robin_is_strictly_cyclic() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::RoundRobin);
        let ctx = SelectionContext::for_service("svc");
        let order: Vec<String> = (0..7).map(|_| pick(&lb, &abc(), &ctx)).collect();
        assert_eq!(order, vec!["A", "B", "C", "A", "B", "C", "A"]);
    }

    #[test]
    fn test_round_robin_cursor_per_key() {
        let lb = LoadBalancer::default();
        let one = SelectionContext::for_service("one");
        let two = SelectionContext::for_service("two");
        assert_eq!(pick(&lb, &abc(), &one), "A");
        assert_eq!(pick(&lb, &abc(), &one), "B");
        assert_eq!(pick(&lb, &abc(), &two), "A");
        // No context shares the default key
        assert_eq!(lb.select_instance(&abc(), None).unwrap().id, "A");
        assert_eq!(lb.select_instance(&abc(), None).unwrap().id, "B");
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let lb = LoadBalancer::default();
        let ctx = SelectionContext::for_service("svc");
        let mut instances = abc();
        instances[1].status = InstanceStatus::Down;
        let order: Vec<String> = (0..4).map(|_| pick(&lb, &instances, &ctx)).collect();
        assert_eq!(order, vec!["A", "C", "A", "C"]);
    }

    #[test]
    fn test_none_when_empty_or_all_down() {
        let lb = LoadBalancer::default();
        assert!(lb.select_instance(&[], None).is_none());

        let mut instances = abc();
        for i in &mut instances {
            i.status = InstanceStatus::Starting;
        }
        assert!(lb.select_instance(&instances, None).is_none());
    }

    #[test]
    fn test_strategy_switch_resets_cursors() {
        let lb = LoadBalancer::default();
        let ctx = SelectionContext::for_service("svc");
        assert_eq!(pick(&lb, &abc(), &ctx), "A");
        assert_eq!(pick(&lb, &abc(), &ctx), "B");

        lb.update_strategy(LoadBalanceStrategy::Random);
        assert_eq!(lb.strategy(), LoadBalanceStrategy::Random);
        lb.update_strategy(LoadBalanceStrategy::RoundRobin);
        assert_eq!(pick(&lb, &abc(), &ctx), "A");
    }

    #[test]
    fn test_unknown_strategy_name_falls_back_to_random() {
        let lb = LoadBalancer::default();
        lb.update_strategy_named("telepathic");
        assert_eq!(lb.strategy(), LoadBalanceStrategy::Random);
        let chosen = lb.select_instance(&abc(), None).unwrap();
        assert!(["A", "B", "C"].contains(&chosen.id.as_str()));
    }

    #[test]
    fn test_least_connections_prefers_idle_instances() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::LeastConnections);
        let instances = abc();
        let ctx = SelectionContext::for_service("svc");

        let first = lb.select_instance(&instances, Some(&ctx)).unwrap();
        assert_eq!(first.id, "A");
        let guard_a = lb.track(&first);

        let second = lb.select_instance(&instances, Some(&ctx)).unwrap();
        assert_eq!(second.id, "B");
        let _guard_b = lb.track(&second);

        assert_eq!(pick(&lb, &instances, &ctx), "C");
        assert_eq!(lb.in_flight(&first), 1);

        drop(guard_a);
        assert_eq!(lb.in_flight(&first), 0);
        assert_eq!(pick(&lb, &instances, &ctx), "A");
    }

    #[test]
    fn test_smooth_weighted_round_robin() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::WeightedRoundRobin);
        let mut instances = abc();
        instances[0].weight = 5;
        let ctx = SelectionContext::for_service("svc");

        let order: Vec<String> = (0..7).map(|_| pick(&lb, &instances, &ctx)).collect();
        assert_eq!(order, vec!["A", "A", "B", "A", "C", "A", "A"]);
    }

    #[test]
    fn test_factory_matches_kind() {
        for kind in [
            LoadBalanceStrategy::RoundRobin,
            LoadBalanceStrategy::Random,
            LoadBalanceStrategy::LeastConnections,
            LoadBalanceStrategy::WeightedRoundRobin,
        ] {
            assert_eq!(LoadBalancerFactory::create_strategy(&kind).kind(), kind);
        }
    }
}

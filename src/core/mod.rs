pub mod breaker_registry;
pub mod circuit_breaker;
pub mod control_plane;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod load_balancer;
pub mod proxy;
pub mod registry;

pub use breaker_registry::CircuitBreakerRegistry;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStats, CircuitState};
pub use control_plane::ControlPlane;
pub use egress::{EgressProxy, EgressRequest};
pub use error::MeshError;
pub use ingress::{IngressProxy, IngressRequest, RouteTable};
pub use load_balancer::{ConnectionGuard, LoadBalancer, LoadBalancerFactory, SelectionContext};
pub use proxy::ProxyResponse;
pub use registry::{
    InstanceStatus, RegistryEvent, RegistryEventKind, ServiceDefinition, ServiceInstance,
    ServiceRegistry, Subscription,
};

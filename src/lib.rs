//! meshgate - a service-mesh resilience and routing layer.
//!
//! meshgate keeps track of service instances, isolates failing targets behind
//! circuit breakers, spreads traffic across healthy instances and exposes all of
//! it through an ingress proxy (path based routing into the mesh) and an egress
//! proxy (calls leaving a service). This library exposes the building blocks so
//! the mesh can be embedded or composed inside your own application; the
//! `meshgate` binary wires them behind an axum server.
//!
//! # Components
//! - [`ServiceRegistry`]: instance bookkeeping with change notifications
//! - [`CircuitBreaker`]: CLOSED / OPEN / HALF_OPEN isolation per target
//! - [`LoadBalancer`]: round-robin, random, least-connections, weighted round-robin
//! - [`IngressProxy`] / [`EgressProxy`]: route, select, guard, forward
//! - [`ControlPlane`]: administrative API over the registry and the policy store
//!
//! # Quick Example
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use meshgate::{
//!     ControlPlane, IngressProxy, IngressRequest, ServiceRegistry,
//!     adapters::{InMemoryConfigManager, ReqwestTransport},
//!     config::{IngressRoute, InstanceRegistration},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let registry = Arc::new(ServiceRegistry::new());
//! let config = Arc::new(InMemoryConfigManager::default());
//! let control_plane = ControlPlane::new(registry.clone(), config.clone());
//! control_plane.register_service("orders", InstanceRegistration::new("o1", "10.0.0.5", 9000))?;
//!
//! let ingress = IngressProxy::new(
//!     vec![IngressRoute::new("/orders", "orders")],
//!     registry,
//!     config,
//!     Arc::new(ReqwestTransport::new(Duration::from_secs(2))?),
//! );
//! let response = ingress.handle_request(IngressRequest::new("GET", "/orders/42")).await;
//! println!("{} in {:?} ms", response.status_code, response.duration_ms);
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits for the configuration source and the
//! outbound transport) from **adapters** (in-memory / HTTP policy stores, the
//! reqwest transport, the axum front end) while keeping business logic inside
//! `core`.
//!
//! # Error Handling
//! Domain failures are typed (`thiserror`) and every proxy failure is turned
//! into a structured [`ProxyResponse`]. Application plumbing returns
//! `eyre::Result<T>` with `WrapErr` context.
//!
//! # Concurrency
//! Shared state sits behind short synchronous critical sections; no lock is
//! held across an `.await`. Breakers are kept in an `scc::HashMap`.
pub mod config;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::core::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry, CircuitState, ControlPlane,
    EgressProxy, EgressRequest, IngressProxy, IngressRequest, LoadBalancer, MeshError,
    ProxyResponse, ServiceInstance, ServiceRegistry,
};
pub use crate::ports::{ConfigurationManager, Transport};

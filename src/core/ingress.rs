//! Inbound side of the mesh: route by path prefix to a service, pick a healthy
//! instance and call it through the service's circuit breaker.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::{
    config::models::{CircuitBreakerConfig, IngressRoute},
    core::{
        breaker_registry::CircuitBreakerRegistry,
        error::MeshError,
        load_balancer::{LoadBalancer, SelectionContext},
        proxy::{
            CallPolicy, ProxyResponse, REQUEST_ID_HEADER, UPSTREAM_HEADER, forwardable_headers,
            guarded_call, load_policy, request_id,
        },
        registry::ServiceRegistry,
    },
    ports::{ConfigurationManager, Transport, TransportRequest},
    tracing_setup::create_request_span,
};

/// Request arriving at the mesh edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressRequest {
    #[serde(default)]
    pub host: Option<String>,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Original bytes when the body is not JSON; forwarded instead of `body`
    #[serde(skip)]
    pub raw_body: Option<Vec<u8>>,
}

impl IngressRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_raw_body(mut self, raw_body: impl Into<Vec<u8>>) -> Self {
        self.raw_body = Some(raw_body.into());
        self
    }
}

/// Routes ordered for matching: longest prefix first, host-bound routes ahead
/// of host-agnostic ones with the same prefix.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<IngressRoute>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<IngressRoute>) -> Self {
        routes.sort_by(|a, b| {
            normalized(&b.prefix)
                .len()
                .cmp(&normalized(&a.prefix).len())
                .then_with(|| b.host.is_some().cmp(&a.host.is_some()))
        });
        Self { routes }
    }

    pub fn routes(&self) -> &[IngressRoute] {
        &self.routes
    }

    pub fn find(&self, host: Option<&str>, method: &str, path: &str) -> Option<&IngressRoute> {
        self.routes.iter().find(|route| {
            prefix_matches(&route.prefix, path)
                && method_matches(&route.methods, method)
                && host_matches(route.host.as_deref(), host)
        })
    }
}

fn normalized(prefix: &str) -> &str {
    match prefix.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Prefix match on whole path segments: `/api` matches `/api` and `/api/x`
/// but not `/apix`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = normalized(prefix);
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

fn method_matches(methods: &[String], method: &str) -> bool {
    methods.is_empty() || methods.iter().any(|m| m.eq_ignore_ascii_case(method))
}

fn host_matches(route_host: Option<&str>, request_host: Option<&str>) -> bool {
    let Some(expected) = route_host else {
        return true;
    };
    request_host
        .map(|host| host.split(':').next().unwrap_or(host))
        .is_some_and(|host| host.eq_ignore_ascii_case(expected))
}

fn upstream_path(route: &IngressRoute, path: &str) -> String {
    if !route.strip_prefix {
        return path.to_string();
    }
    let prefix = normalized(&route.prefix);
    let rest = if prefix == "/" {
        path
    } else {
        path.strip_prefix(prefix).unwrap_or(path)
    };
    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

/// Inbound proxy. Breakers are keyed by service id.
pub struct IngressProxy {
    routes: RwLock<RouteTable>,
    registry: Arc<ServiceRegistry>,
    config: Arc<dyn ConfigurationManager>,
    transport: Arc<dyn Transport>,
    load_balancer: Arc<LoadBalancer>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_defaults: CircuitBreakerConfig,
}

impl IngressProxy {
    pub fn new(
        routes: Vec<IngressRoute>,
        registry: Arc<ServiceRegistry>,
        config: Arc<dyn ConfigurationManager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            routes: RwLock::new(RouteTable::new(routes)),
            registry,
            config,
            transport,
            load_balancer: Arc::new(LoadBalancer::default()),
            breakers: CircuitBreakerRegistry::shared(),
            breaker_defaults: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_load_balancer(mut self, load_balancer: Arc<LoadBalancer>) -> Self {
        self.load_balancer = load_balancer;
        self
    }

    /// Use `breakers` instead of a private registry, e.g. one shared with egress.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Sizing for breakers whose service policy does not override it.
    pub fn with_breaker_defaults(mut self, defaults: CircuitBreakerConfig) -> Self {
        self.breaker_defaults = defaults;
        self
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Replace the routing table.
    pub fn set_routes(&self, routes: Vec<IngressRoute>) {
        let table = RouteTable::new(routes);
        tracing::info!(routes = table.routes().len(), "Ingress routes replaced");
        *self.routes.write().unwrap_or_else(|p| p.into_inner()) = table;
    }

    /// Route and forward one request. Every failure comes back as a response.
    pub async fn handle_request(&self, request: IngressRequest) -> ProxyResponse {
        let started = Instant::now();
        let request_id = request_id(&request.headers);
        let span = create_request_span("ingress", &request.method, &request.path, &request_id);

        async {
            let result = self.forward(request, &request_id).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let response = match result {
                Ok(response) => response.with_duration(duration_ms),
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        status = error.status_code(),
                        "Ingress request failed"
                    );
                    error.into_response(duration_ms)
                }
            };
            let span = tracing::Span::current();
            span.record("http.status_code", response.status_code);
            span.record("duration_ms", duration_ms);
            response.with_header(REQUEST_ID_HEADER, request_id.clone())
        }
        .instrument(span)
        .await
    }

    async fn forward(
        &self,
        request: IngressRequest,
        request_id: &str,
    ) -> Result<ProxyResponse, MeshError> {
        let route = {
            let routes = self.routes.read().unwrap_or_else(|p| p.into_inner());
            routes
                .find(request.host.as_deref(), &request.method, &request.path)
                .cloned()
        }
        .ok_or_else(|| MeshError::RouteNotFound {
            method: request.method.clone(),
            path: request.path.clone(),
        })?;
        let service_id = route.service_id.as_str();

        let (global, service) = load_policy(self.config.as_ref(), Some(service_id)).await;

        let endpoints = self.registry.get_service_endpoints(service_id);
        let instance = self
            .load_balancer
            .select_instance(&endpoints, Some(&SelectionContext::for_service(service_id)))
            .ok_or_else(|| MeshError::NoHealthyInstances {
                service_id: service_id.to_string(),
            })?;

        let breaker = self
            .breakers
            .get_or_create(service_id, self.breaker_defaults.overlay(&service))
            .await;

        let address = instance.address();
        let url = format!("http://{}{}", address, upstream_path(&route, &request.path));
        let mut outbound = TransportRequest::new(request.method.clone(), url);
        outbound.headers = forwardable_headers(&request.headers);
        outbound
            .headers
            .insert(REQUEST_ID_HEADER.to_string(), request_id.to_string());
        if let Some(host) = &request.host {
            outbound
                .headers
                .insert("x-forwarded-host".to_string(), host.clone());
        }
        outbound.params = request.query;
        outbound.data = request.body;
        outbound.raw_body = request.raw_body;

        tracing::debug!(
            service_id,
            instance_id = %instance.id,
            url = %outbound.url,
            "Forwarding ingress request"
        );

        let _in_flight = self.load_balancer.track(&instance);
        let response = guarded_call(
            &self.transport,
            &breaker,
            outbound,
            CallPolicy::resolve(&global, &service),
        )
        .await?;

        Ok(ProxyResponse::from_upstream(response).with_header(UPSTREAM_HEADER, address))
    }

    /// Cancel the timers of every breaker this proxy holds.
    pub async fn dispose(&self) {
        self.breakers.dispose_all().await;
    }
}

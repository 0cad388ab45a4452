//! Outbound side of the mesh: calls leaving a service to an explicit
//! `host:port`, isolated per target or per named policy.
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use url::Url;

use crate::{
    config::models::CircuitBreakerConfig,
    core::{
        breaker_registry::CircuitBreakerRegistry,
        error::MeshError,
        proxy::{
            CallPolicy, ProxyResponse, REQUEST_ID_HEADER, forwardable_headers, guarded_call,
            load_policy, request_id,
        },
    },
    ports::{ConfigurationManager, Transport, TransportRequest},
    tracing_setup::create_request_span,
};

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

/// Call leaving the mesh towards a concrete target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressRequest {
    pub target_host: String,
    pub target_port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Named policy; all targets sharing it share one breaker
    #[serde(default)]
    pub policy_name: Option<String>,
    /// Per-request timeout, wins over every configured value
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl EgressRequest {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            path: default_path(),
            method: default_method(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            policy_name: None,
            timeout_ms: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_policy(mut self, policy_name: impl Into<String>) -> Self {
        self.policy_name = Some(policy_name.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// The named policy, with an empty name treated as no policy.
    pub fn policy(&self) -> Option<&str> {
        self.policy_name.as_deref().filter(|p| !p.is_empty())
    }

    /// Breaker key: the policy name when given, else `host:port`.
    pub fn breaker_id(&self) -> String {
        match self.policy() {
            Some(policy) => policy.to_string(),
            None => format!("{}:{}", self.target_host, self.target_port),
        }
    }

    fn target_url(&self) -> Result<Url, MeshError> {
        if self.target_host.trim().is_empty() {
            return Err(MeshError::InvalidTarget("target_host is empty".into()));
        }
        if self.target_port == 0 {
            return Err(MeshError::InvalidTarget("target_port must be non-zero".into()));
        }
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let raw = format!("http://{}:{}{}", self.target_host, self.target_port, path);
        Url::parse(&raw).map_err(|e| MeshError::InvalidTarget(format!("{raw}: {e}")))
    }
}

/// Outbound proxy. Breakers are keyed by policy name or `host:port`.
pub struct EgressProxy {
    config: Arc<dyn ConfigurationManager>,
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_defaults: CircuitBreakerConfig,
}

impl EgressProxy {
    pub fn new(config: Arc<dyn ConfigurationManager>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            breakers: CircuitBreakerRegistry::shared(),
            breaker_defaults: CircuitBreakerConfig::default(),
        }
    }

    /// Use `breakers` instead of a private registry, e.g. one shared with ingress.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_breaker_defaults(mut self, defaults: CircuitBreakerConfig) -> Self {
        self.breaker_defaults = defaults;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub async fn handle_request(&self, request: EgressRequest) -> ProxyResponse {
        let started = Instant::now();
        let request_id = request_id(&request.headers);
        let span = create_request_span("egress", &request.method, &request.path, &request_id);

        async {
            let result = self.forward(request, &request_id).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let response = match result {
                Ok(response) => response.with_duration(duration_ms),
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        status = error.status_code(),
                        "Egress request failed"
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
        request: EgressRequest,
        request_id: &str,
    ) -> Result<ProxyResponse, MeshError> {
        let url = request.target_url()?;
        if request.timeout_ms == Some(0) {
            return Err(MeshError::InvalidRequest("timeout_ms must be greater than 0".into()));
        }
        let policy_name = request.policy();
        let breaker_id = request.breaker_id();

        let (global, service) = load_policy(self.config.as_ref(), policy_name).await;
        let mut policy = CallPolicy::resolve(&global, &service);
        if let Some(timeout_ms) = request.timeout_ms {
            policy.timeout = Duration::from_millis(timeout_ms);
        }

        // Only a named policy may size the breaker; host:port keys use defaults
        let breaker_config = match policy_name {
            Some(_) => self.breaker_defaults.overlay(&service),
            None => self.breaker_defaults,
        };
        let breaker = self.breakers.get_or_create(&breaker_id, breaker_config).await;

        let mut outbound = TransportRequest::new(request.method, url.to_string());
        outbound.headers = forwardable_headers(&request.headers);
        outbound
            .headers
            .insert(REQUEST_ID_HEADER.to_string(), request_id.to_string());
        outbound.params = request.query;
        outbound.data = request.body;

        tracing::debug!(
            breaker = %breaker_id,
            url = %outbound.url,
            timeout_ms = policy.timeout.as_millis() as u64,
            "Forwarding egress request"
        );

        let response = guarded_call(&self.transport, &breaker, outbound, policy).await?;
        Ok(ProxyResponse::from_upstream(response))
    }

    pub async fn dispose(&self) {
        self.breakers.dispose_all().await;
    }
}

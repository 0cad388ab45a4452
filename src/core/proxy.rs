//! Pieces shared by the ingress and egress proxies: the response shape, policy
//! lookup and the guarded upstream call with timeout and retries.
use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::{
    config::models::{MeshGlobalConfig, MeshServiceConfig},
    core::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerError},
        error::MeshError,
    },
    ports::{ConfigurationManager, Transport, TransportError, TransportRequest, TransportResponse},
    tracing_setup::create_upstream_span,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const UPSTREAM_HEADER: &str = "x-mesh-upstream";

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Result of a proxied call, identical for ingress and egress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Upstream bytes of a body that is not JSON, relayed as received
    #[serde(skip)]
    pub raw_body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ProxyResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: None,
            raw_body: None,
            duration_ms: None,
        }
    }

    /// Wrap an upstream answer, dropping its hop-by-hop headers.
    pub fn from_upstream(response: TransportResponse) -> Self {
        let body = match response.data {
            Value::Null => None,
            data => Some(data),
        };
        Self {
            status_code: response.status,
            headers: forwardable_headers(&response.headers),
            body,
            raw_body: response.raw_body,
            duration_ms: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self.raw_body = None;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Copy of `headers` without hop-by-hop entries (case-insensitive).
pub fn forwardable_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            !HOP_BY_HOP_HEADERS
                .iter()
                .any(|hop| name.eq_ignore_ascii_case(hop))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Reuse the caller's request id when present, otherwise mint one.
pub fn request_id(headers: &HashMap<String, String>) -> String {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(REQUEST_ID_HEADER))
        .map(|(_, value)| value.clone())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Effective timeout and retry budget for one proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retries: u32,
}

impl CallPolicy {
    pub fn resolve(global: &MeshGlobalConfig, service: &MeshServiceConfig) -> Self {
        Self {
            timeout: service.effective_timeout(global),
            retries: service.effective_retries(global),
        }
    }
}

/// Current global and per-id policy. Lookup failures are logged and replaced by
/// defaults; they never fail the request.
pub async fn load_policy(
    config: &dyn ConfigurationManager,
    id: Option<&str>,
) -> (MeshGlobalConfig, MeshServiceConfig) {
    let global = match config.get_global_config().await {
        Ok(global) => global,
        Err(e) => {
            tracing::warn!(error = %e, "Global configuration unavailable, using defaults");
            MeshGlobalConfig::default()
        }
    };

    let service = match id {
        Some(id) => match config.get_service_config(id).await {
            Ok(service) => service,
            Err(e) => {
                tracing::warn!(
                    policy = id,
                    error = %e,
                    "Service configuration unavailable, using defaults"
                );
                MeshServiceConfig::default()
            }
        },
        None => MeshServiceConfig::default(),
    };

    (global, service)
}

/// Run `request` through `breaker`, retrying qualifying failures up to
/// `policy.retries` extra times. An open circuit ends the loop at once.
pub async fn guarded_call(
    transport: &Arc<dyn Transport>,
    breaker: &CircuitBreaker,
    request: TransportRequest,
    policy: CallPolicy,
) -> Result<TransportResponse, MeshError> {
    let target = breaker.name().to_string();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let span = create_upstream_span(&target, &request.url, attempt);
        let outcome = breaker
            .execute(|| call_upstream(transport, request.clone(), policy.timeout))
            .instrument(span.clone())
            .await;

        match outcome {
            Ok(response) => {
                span.record("http.status_code", response.status);
                return Ok(response);
            }
            Err(CircuitBreakerError::Open { name }) => {
                tracing::warn!(breaker = %name, attempt, "Circuit open, upstream not called");
                return Err(MeshError::CircuitOpen { name });
            }
            Err(CircuitBreakerError::Operation(error)) => {
                if let TransportError::UpstreamStatus { status, .. } = &error {
                    span.record("http.status_code", *status);
                }
                if attempt > policy.retries {
                    tracing::error!(
                        breaker = %target,
                        attempts = attempt,
                        error = %error,
                        "Upstream call failed"
                    );
                    return Err(MeshError::UpstreamFailure {
                        target,
                        message: error.to_string(),
                    });
                }
                tracing::debug!(
                    breaker = %target,
                    attempt,
                    error = %error,
                    "Retrying upstream call"
                );
            }
        }
    }
}

/// One attempt: enforce the timeout and classify 5xx answers as failures.
async fn call_upstream(
    transport: &Arc<dyn Transport>,
    mut request: TransportRequest,
    timeout: Duration,
) -> Result<TransportResponse, TransportError> {
    request.timeout = Some(timeout);
    let url = request.url.clone();
    let response = tokio::time::timeout(timeout, transport.request(request))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

    if response.is_server_error() {
        return Err(TransportError::UpstreamStatus {
            url,
            status: response.status,
        });
    }
    Ok(response)
}

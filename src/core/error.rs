use serde_json::json;
use thiserror::Error;

use crate::core::proxy::ProxyResponse;

/// Failures a proxy turns into a structured response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MeshError {
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("No healthy instances for service '{service_id}'")]
    NoHealthyInstances { service_id: String },

    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Upstream call failed; `message` keeps the transport's own wording
    #[error("Upstream {target} failed: {message}")]
    UpstreamFailure { target: String, message: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl MeshError {
    pub fn status_code(&self) -> u16 {
        match self {
            MeshError::RouteNotFound { .. } => 404,
            MeshError::NoHealthyInstances { .. } | MeshError::CircuitOpen { .. } => 503,
            MeshError::UpstreamFailure { .. } => 502,
            MeshError::InvalidTarget(_) | MeshError::InvalidRequest(_) => 400,
        }
    }

    /// Short label used as the `error` field of the response body.
    pub fn label(&self) -> &'static str {
        match self {
            MeshError::RouteNotFound { .. } => "Not Found",
            MeshError::NoHealthyInstances { .. } => "Service Unavailable",
            MeshError::CircuitOpen { .. } => "Circuit Open",
            MeshError::UpstreamFailure { .. } => "Bad Gateway",
            MeshError::InvalidTarget(_) | MeshError::InvalidRequest(_) => "Bad Request",
        }
    }

    pub fn into_response(self, duration_ms: u64) -> ProxyResponse {
        let body = json!({
            "error": self.label(),
            "details": self.to_string(),
        });
        ProxyResponse::new(self.status_code())
            .with_body(body)
            .with_duration(duration_ms)
    }
}

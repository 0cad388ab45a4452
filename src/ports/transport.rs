use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Custom error type for transport operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the request times out
    #[error("Timeout error after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Error when the request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error when the upstream answers with a server error
    #[error("Upstream returned error status: {status}, url: {url}")]
    UpstreamStatus {
        /// The URL that was requested
        url: String,
        /// The status code returned by the upstream
        status: u16,
    },
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Outbound call description handed to a [`Transport`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: Option<Value>,
    /// Body bytes sent verbatim; wins over `data` when set
    #[serde(skip)]
    pub raw_body: Option<Vec<u8>>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            data: None,
            raw_body: None,
            params: HashMap::new(),
            timeout: None,
        }
    }
}

/// Upstream answer as seen by the proxies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: Value,
    /// Original bytes of a body that is not JSON
    #[serde(skip)]
    pub raw_body: Option<Vec<u8>>,
}

impl TransportResponse {
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Case-insensitive header lookup.
pub fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// `application/json` and every `+json` media type.
pub fn is_json_content_type(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    media_type.eq_ignore_ascii_case("application/json")
        || media_type.to_ascii_lowercase().ends_with("+json")
}

/// Split a body into its JSON value and, when it is not JSON, its original
/// bytes. Untyped bodies are tried as JSON; anything else keeps the bytes and
/// carries a lossy text rendering in the value.
pub fn decode_payload(content_type: Option<&str>, bytes: &[u8]) -> (Value, Option<Vec<u8>>) {
    if bytes.is_empty() {
        return (Value::Null, None);
    }
    if content_type.is_none_or(is_json_content_type) {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return (value, None);
        }
    }
    (
        Value::String(String::from_utf8_lossy(bytes).into_owned()),
        Some(bytes.to_vec()),
    )
}

/// Transport defines the port (interface) that performs the actual network call.
///
/// Implementations return `Ok` for every HTTP status they receive; classifying
/// server errors is the caller's business.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request to an upstream
    ///
    /// # Arguments
    /// * `req` - Method, absolute URL, headers, body, query and timeout
    ///
    /// # Returns
    /// A future that resolves to the upstream's response or an error
    async fn request(&self, req: TransportRequest) -> TransportResult<TransportResponse>;
}

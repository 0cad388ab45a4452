use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::ports::transport::{
    Transport, TransportError, TransportRequest, TransportResponse, TransportResult,
    decode_payload, find_header, is_json_content_type,
};

/// HTTP transport adapter using reqwest.
///
/// Responsibilities:
/// * Maps [`TransportRequest`] onto a reqwest call (method, headers, query, body)
/// * Applies the per-request timeout when one is set
/// * Decodes JSON bodies and keeps the bytes of anything else
///
/// Every HTTP status is returned as `Ok`; deciding what counts as a failure
/// belongs to the proxies.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::ConnectionError(format!("failed to build client: {e}")))?;
        tracing::info!("Created reqwest transport");
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn classify(error: reqwest::Error, timeout: Option<Duration>) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(timeout.unwrap_or_default())
        } else if error.is_builder() {
            TransportError::InvalidRequest(error.to_string())
        } else {
            TransportError::ConnectionError(error.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(&self, req: TransportRequest) -> TransportResult<TransportResponse> {
        let method = Method::from_bytes(req.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("method {}: {e}", req.method)))?;

        let mut builder = self.client.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !req.params.is_empty() {
            builder = builder.query(&req.params);
        }
        let declared_json =
            find_header(&req.headers, "content-type").is_none_or(is_json_content_type);
        builder = match (&req.raw_body, &req.data) {
            (Some(raw), _) => builder.body(raw.clone()),
            // Text declared as something else goes out as-is, not as a JSON string
            (None, Some(Value::String(text))) if !declared_json => builder.body(text.clone()),
            (None, Some(body)) => builder.json(body),
            (None, None) => builder,
        };
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify(e, req.timeout))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, req.timeout))?;

        tracing::debug!(url = %req.url, status = status.as_u16(), "Upstream responded");

        let (data, raw_body) = decode_payload(find_header(&headers, "content-type"), &bytes);
        Ok(TransportResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            data,
            raw_body,
        })
    }
}

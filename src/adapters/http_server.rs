//! Axum front end for the mesh.
//!
//! Administrative routes live under a configurable prefix (default `/_mesh`);
//! every other request is handed to the ingress proxy.
use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Path, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::{
    config::models::{InstanceRegistration, MeshGlobalConfig, MeshServiceConfig},
    core::{
        control_plane::ControlPlane,
        egress::{EgressProxy, EgressRequest},
        ingress::{IngressProxy, IngressRequest},
        proxy::ProxyResponse,
    },
    ports::{ConfigError, ConfigResult, decode_payload, find_header, is_json_content_type},
};

/// Largest request body the ingress will buffer.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared handles used by every handler.
#[derive(Clone)]
pub struct MeshState {
    pub control_plane: Arc<ControlPlane>,
    pub ingress: Arc<IngressProxy>,
    pub egress: Arc<EgressProxy>,
}

/// Build the full application router.
pub fn build_router(state: MeshState, admin_prefix: &str) -> Router {
    let admin = Router::new()
        .route("/services", get(list_services))
        .route("/services/{id}/endpoints", get(list_endpoints))
        .route("/services/{id}/instances", post(register_instance))
        .route("/services/{id}/instances/{iid}", delete(deregister_instance))
        .route("/services/{id}/instances/{iid}/metadata", put(update_metadata))
        .route("/services/{id}/instances/{iid}/heartbeat", post(heartbeat))
        .route("/config/global", put(update_global))
        .route("/config/services/{id}", put(update_service))
        .route("/breakers", get(list_breakers))
        .route("/egress", post(egress));

    Router::new()
        .nest(admin_prefix, admin)
        .fallback(ingress)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_services(State(state): State<MeshState>) -> impl IntoResponse {
    Json(state.control_plane.get_all_services())
}

async fn list_endpoints(
    State(state): State<MeshState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.control_plane.get_service_endpoints(&id))
}

async fn register_instance(
    State(state): State<MeshState>,
    Path(id): Path<String>,
    Json(registration): Json<InstanceRegistration>,
) -> Response {
    match state.control_plane.register_service(&id, registration) {
        Ok(instance) => (StatusCode::CREATED, Json(instance)).into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

fn bad_request(details: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Bad Request", "details": details })),
    )
        .into_response()
}

fn found_or_404(found: bool) -> StatusCode {
    if found {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn deregister_instance(
    State(state): State<MeshState>,
    Path((id, iid)): Path<(String, String)>,
) -> StatusCode {
    found_or_404(state.control_plane.deregister_service(&id, &iid))
}

async fn update_metadata(
    State(state): State<MeshState>,
    Path((id, iid)): Path<(String, String)>,
    Json(metadata): Json<HashMap<String, String>>,
) -> StatusCode {
    found_or_404(state.control_plane.update_service_metadata(&id, &iid, metadata))
}

async fn heartbeat(
    State(state): State<MeshState>,
    Path((id, iid)): Path<(String, String)>,
) -> StatusCode {
    found_or_404(state.control_plane.heartbeat(&id, &iid))
}

fn config_outcome(result: ConfigResult<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(ConfigError::Invalid(details)) => bad_request(details),
        Err(e) => {
            tracing::error!(error = %e, "Configuration update failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "Configuration Update Failed", "details": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn update_global(
    State(state): State<MeshState>,
    Json(config): Json<MeshGlobalConfig>,
) -> Response {
    config_outcome(state.control_plane.update_global_configuration(config).await)
}

async fn update_service(
    State(state): State<MeshState>,
    Path(id): Path<String>,
    Json(config): Json<MeshServiceConfig>,
) -> Response {
    config_outcome(
        state
            .control_plane
            .update_service_configuration(&id, config)
            .await,
    )
}

async fn list_breakers(State(state): State<MeshState>) -> impl IntoResponse {
    let ingress = state.ingress.breakers().snapshot().await;
    if Arc::ptr_eq(state.ingress.breakers(), state.egress.breakers()) {
        return Json(json!({ "shared": ingress }));
    }
    let egress = state.egress.breakers().snapshot().await;
    Json(json!({ "ingress": ingress, "egress": egress }))
}

async fn egress(State(state): State<MeshState>, Json(request): Json<EgressRequest>) -> Response {
    into_http(state.egress.handle_request(request).await)
}

async fn ingress(State(state): State<MeshState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.host().map(str::to_string));
    let query: HashMap<String, String> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let (body, raw_body) = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => match decode_payload(find_header(&headers, "content-type"), &bytes) {
            (Value::Null, None) => (None, None),
            (value, raw_body) => (Some(value), raw_body),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request body");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "Payload Too Large", "details": e.to_string() })),
            )
                .into_response();
        }
    };

    let request = IngressRequest {
        host,
        path: parts.uri.path().to_string(),
        method: parts.method.as_str().to_string(),
        headers,
        query,
        body,
        raw_body,
    };
    into_http(state.ingress.handle_request(request).await)
}

/// Turn a [`ProxyResponse`] into an HTTP response. Raw upstream bytes are
/// relayed untouched; the upstream's content type always wins over the
/// default picked for a JSON or text body.
fn into_http(response: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let declared = find_header(&response.headers, "content-type");
    let declared_json = declared.is_some_and(is_json_content_type);
    let (body, default_type) = match (response.raw_body, response.body) {
        (Some(raw), _) => (Body::from(raw), None),
        (None, None) => (Body::empty(), None),
        (None, Some(Value::String(text))) if !declared_json => {
            (Body::from(text), Some("text/plain; charset=utf-8"))
        }
        (None, Some(value)) => (Body::from(value.to_string()), Some("application/json")),
    };
    let default_type = default_type.filter(|_| declared.is_none());

    let mut http = Response::new(body);
    *http.status_mut() = status;
    let headers = http.headers_mut();
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::debug!(header = %name, "Dropping unrepresentable header"),
        }
    }
    if let Some(content_type) = default_type {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    if let Some(duration_ms) = response.duration_ms {
        if let Ok(value) = HeaderValue::from_str(&duration_ms.to_string()) {
            headers.insert("x-mesh-duration-ms", value);
        }
    }
    http
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::config_managers::InMemoryConfigManager,
        config::models::IngressRoute,
        core::registry::ServiceRegistry,
        ports::{Transport, TransportRequest, TransportResponse, TransportResult},
    };

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn request(&self, req: TransportRequest) -> TransportResult<TransportResponse> {
            Ok(TransportResponse {
                status: 200,
                status_text: "OK".into(),
                headers: HashMap::new(),
                data: json!({ "method": req.method, "url": req.url, "body": req.data }),
                raw_body: None,
            })
        }
    }

    /// Answers with the request's own bytes as HTML and reports the content
    /// type it was sent with.
    struct HtmlMirror;

    #[async_trait]
    impl Transport for HtmlMirror {
        async fn request(&self, req: TransportRequest) -> TransportResult<TransportResponse> {
            let seen = find_header(&req.headers, "content-type")
                .unwrap_or_default()
                .to_string();
            Ok(TransportResponse {
                status: 200,
                status_text: "OK".into(),
                headers: HashMap::from([
                    ("content-type".to_string(), "text/html".to_string()),
                    ("x-seen-content-type".to_string(), seen),
                ]),
                data: Value::Null,
                raw_body: req.raw_body,
            })
        }
    }

    fn app() -> Router {
        app_with(Arc::new(Echo))
    }

    fn app_with(transport: Arc<dyn Transport>) -> Router {
        let registry = Arc::new(ServiceRegistry::new());
        let config = Arc::new(InMemoryConfigManager::default());
        let control_plane = Arc::new(ControlPlane::new(registry.clone(), config.clone()));
        let ingress = Arc::new(IngressProxy::new(
            vec![IngressRoute::new("/orders", "orders")],
            registry,
            config.clone(),
            transport.clone(),
        ));
        let egress = Arc::new(EgressProxy::new(config, transport));
        build_router(
            MeshState {
                control_plane,
                ingress,
                egress,
            },
            "/_mesh",
        )
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_then_route_through_ingress() {
        let app = app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/_mesh/services/orders/instances",
                json!({ "id": "o1", "host": "10.0.0.5", "port": 9000 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/orders/42?x=1", json!({ "qty": 2 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-mesh-upstream"], "10.0.0.5:9000");
        assert!(response.headers().contains_key("x-request-id"));
        let body = json_body(response).await;
        assert_eq!(body["url"], "http://10.0.0.5:9000/42");
        assert_eq!(body["body"]["qty"], 2);
    }

    #[tokio::test]
    async fn test_form_body_and_upstream_content_type_are_preserved() {
        let app = app_with(Arc::new(HtmlMirror));
        app.clone()
            .oneshot(json_request(
                "POST",
                "/_mesh/services/orders/instances",
                json!({ "id": "o1", "host": "10.0.0.5", "port": 9000 }),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/orders/form")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("a=1&b=2"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        assert_eq!(
            response.headers()["x-seen-content-type"],
            "application/x-www-form-urlencoded"
        );
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        assert_eq!(&bytes[..], b"a=1&b=2");
    }

    #[tokio::test]
    async fn test_invalid_admin_input_is_rejected() {
        let app = app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/_mesh/services/orders/instances",
                json!({ "id": "o1", "host": "10.0.0.5", "port": 0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/_mesh/config/global",
                json!({ "default_timeout_ms": 0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Bad Request");

        let response = app
            .oneshot(json_request(
                "PUT",
                "/_mesh/config/services/orders",
                json!({ "failure_threshold": 0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404_and_empty_service_is_503() {
        let app = app();

        let response = app
            .clone()
            .oneshot(HttpRequest::builder().uri("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(HttpRequest::builder().uri("/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "Service Unavailable");
    }

    #[tokio::test]
    async fn test_admin_instance_lifecycle() {
        let app = app();
        app.clone()
            .oneshot(json_request(
                "POST",
                "/_mesh/services/svc/instances",
                json!({ "id": "i1", "host": "h", "port": 1 }),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/_mesh/services/svc/instances/i1/metadata",
                json!({ "zone": "a" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/_mesh/services/svc/endpoints")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let endpoints = json_body(response).await;
        assert_eq!(endpoints[0]["metadata"]["zone"], "a");

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("DELETE")
                    .uri("/_mesh/services/svc/instances/i1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("DELETE")
                    .uri("/_mesh/services/svc/instances/i1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_egress_and_breaker_listing() {
        let app = app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/_mesh/egress",
                json!({
                    "target_host": "api.partner",
                    "target_port": 8443,
                    "policy_name": "partner"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/_mesh/breakers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let breakers = json_body(response).await;
        assert_eq!(breakers["egress"][0]["name"], "partner");
        assert_eq!(breakers["egress"][0]["state"], "CLOSED");
        assert_eq!(breakers["ingress"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_config_update_endpoint() {
        let app = app();
        let response = app
            .oneshot(json_request(
                "PUT",
                "/_mesh/config/global",
                json!({ "default_timeout_ms": 250, "default_retries": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}

// Integration tests for ingress routing, balancing and failure mapping
mod common;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use meshgate::{
        IngressProxy, IngressRequest, LoadBalancer, ServiceRegistry,
        config::{
            CircuitBreakerConfig, IngressRoute, InstanceRegistration, LoadBalanceStrategy,
            MeshServiceConfig,
        },
        core::InstanceStatus,
        ports::{ConfigurationManager, Transport},
    };

    use crate::common::{BrokenConfigManager, Reply, ScriptedTransport, config_manager};

    struct Fixture {
        registry: Arc<ServiceRegistry>,
        transport: Arc<ScriptedTransport>,
        config: Arc<meshgate::adapters::InMemoryConfigManager>,
        proxy: IngressProxy,
    }

    fn fixture(routes: Vec<IngressRoute>) -> Fixture {
        let registry = Arc::new(ServiceRegistry::new());
        let transport = ScriptedTransport::new();
        let config = config_manager();
        let as_transport: Arc<dyn Transport> = transport.clone();
        let as_config: Arc<dyn ConfigurationManager> = config.clone();
        let proxy = IngressProxy::new(routes, registry.clone(), as_config, as_transport);
        Fixture {
            registry,
            transport,
            config,
            proxy,
        }
    }

    fn upstream(response: &meshgate::ProxyResponse) -> String {
        response
            .headers
            .get("x-mesh-upstream")
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_service_without_instances_is_unavailable() {
        let f = fixture(vec![IngressRoute::new("/service-a", "service-a")]);

        let response = f
            .proxy
            .handle_request(IngressRequest::new("GET", "/service-a/users"))
            .await;

        assert_eq!(response.status_code, 503);
        assert_eq!(response.body.as_ref().unwrap()["error"], "Service Unavailable");
        assert!(response.duration_ms.is_some());
        assert!(response.headers.contains_key("x-request-id"));
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unmatched_path_is_not_found() {
        let f = fixture(vec![IngressRoute::new("/service-a", "service-a")]);
        let response = f
            .proxy
            .handle_request(IngressRequest::new("GET", "/service-b"))
            .await;
        assert_eq!(response.status_code, 404);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_robin_across_instances() {
        let f = fixture(vec![IngressRoute::new("/orders", "orders")]);
        for (id, port) in [("a", 8001), ("b", 8002), ("c", 8003)] {
            f.registry
                .register_service("orders", InstanceRegistration::new(id, "10.1.0.1", port));
        }

        let mut seen = Vec::new();
        for _ in 0..6 {
            let response = f
                .proxy
                .handle_request(IngressRequest::new("GET", "/orders/1"))
                .await;
            assert_eq!(response.status_code, 200);
            seen.push(upstream(&response));
        }
        assert_eq!(
            seen,
            vec![
                "10.1.0.1:8001",
                "10.1.0.1:8002",
                "10.1.0.1:8003",
                "10.1.0.1:8001",
                "10.1.0.1:8002",
                "10.1.0.1:8003",
            ]
        );
        assert_eq!(f.transport.calls()[0], "http://10.1.0.1:8001/1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_down_instances_are_skipped() {
        let f = fixture(vec![IngressRoute::new("/orders", "orders")]);
        f.registry
            .register_service("orders", InstanceRegistration::new("a", "10.1.0.1", 8001));
        f.registry
            .register_service("orders", InstanceRegistration::new("b", "10.1.0.2", 8001));
        f.registry
            .set_instance_status("orders", "a", InstanceStatus::Down);

        for _ in 0..3 {
            let response = f
                .proxy
                .handle_request(IngressRequest::new("GET", "/orders"))
                .await;
            assert_eq!(upstream(&response), "10.1.0.2:8001");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upstream_failures_map_to_502_then_circuit_open() {
        let f = fixture(vec![IngressRoute::new("/pay", "payments")]);
        f.registry
            .register_service("payments", InstanceRegistration::new("p1", "10.2.0.1", 9000));
        f.config
            .update_service_config(
                "payments",
                MeshServiceConfig {
                    failure_threshold: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        f.transport.reply("10.2.0.1:9000", Reply::Status(500));

        for _ in 0..2 {
            let response = f
                .proxy
                .handle_request(IngressRequest::new("POST", "/pay"))
                .await;
            assert_eq!(response.status_code, 502);
            assert_eq!(response.body.as_ref().unwrap()["error"], "Bad Gateway");
        }

        let response = f
            .proxy
            .handle_request(IngressRequest::new("POST", "/pay"))
            .await;
        assert_eq!(response.status_code, 503);
        assert_eq!(response.body.as_ref().unwrap()["error"], "Circuit Open");
        assert_eq!(f.transport.calls_to("10.2.0.1:9000"), 2);

        f.proxy.dispose().await;
        assert!(f.proxy.breakers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connection_errors_keep_transport_message() {
        let f = fixture(vec![IngressRoute::new("/", "catalog")]);
        f.registry
            .register_service("catalog", InstanceRegistration::new("c1", "10.3.0.1", 80));
        f.transport.reply("10.3.0.1:80", Reply::Refused);

        let response = f
            .proxy
            .handle_request(IngressRequest::new("GET", "/items"))
            .await;
        assert_eq!(response.status_code, 502);
        let details = response.body.unwrap()["details"].as_str().unwrap().to_string();
        assert!(details.contains("connection refused"), "{details}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_weighted_strategy_and_breaker_defaults() {
        let f = fixture(vec![IngressRoute::new("/search", "search")]);
        let proxy = f
            .proxy
            .with_load_balancer(Arc::new(LoadBalancer::new(
                LoadBalanceStrategy::WeightedRoundRobin,
            )))
            .with_breaker_defaults(CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            });
        f.registry.register_service(
            "search",
            InstanceRegistration::new("big", "10.4.0.1", 80).with_weight(3),
        );
        f.registry
            .register_service("search", InstanceRegistration::new("small", "10.4.0.2", 80));

        let mut big = 0;
        for _ in 0..8 {
            let response = proxy
                .handle_request(IngressRequest::new("GET", "/search"))
                .await;
            if upstream(&response) == "10.4.0.1:80" {
                big += 1;
            }
        }
        assert_eq!(big, 6);

        f.transport.reply("10.4.0.1:80", Reply::Status(503));
        let response = proxy
            .handle_request(IngressRequest::new("GET", "/search"))
            .await;
        assert_eq!(response.status_code, 502);
        let breaker = proxy.breakers().get("search").await.unwrap();
        assert_eq!(breaker.state(), meshgate::CircuitState::Open);
        proxy.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_routes_replaces_the_table() {
        let f = fixture(vec![IngressRoute::new("/v1", "legacy")]);
        f.registry
            .register_service("legacy", InstanceRegistration::new("l1", "10.5.0.1", 80));
        f.registry
            .register_service("current", InstanceRegistration::new("c1", "10.5.0.2", 80));

        let response = f
            .proxy
            .handle_request(IngressRequest::new("GET", "/v1/items"))
            .await;
        assert_eq!(upstream(&response), "10.5.0.1:80");

        f.proxy
            .set_routes(vec![IngressRoute::new("/v2", "current").with_methods(["GET"])]);

        let response = f
            .proxy
            .handle_request(IngressRequest::new("GET", "/v1/items"))
            .await;
        assert_eq!(response.status_code, 404);
        let response = f
            .proxy
            .handle_request(IngressRequest::new("GET", "/v2/items"))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(upstream(&response), "10.5.0.2:80");
        let response = f
            .proxy
            .handle_request(IngressRequest::new("POST", "/v2/items"))
            .await;
        assert_eq!(response.status_code, 404);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_policy_store_uses_defaults() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register_service("orders", InstanceRegistration::new("o1", "10.6.0.1", 80));
        let transport = ScriptedTransport::new();
        let as_transport: Arc<dyn Transport> = transport.clone();
        let proxy = IngressProxy::new(
            vec![IngressRoute::new("/orders", "orders")],
            registry,
            Arc::new(BrokenConfigManager),
            as_transport,
        );

        let response = proxy
            .handle_request(IngressRequest::new("GET", "/orders/7"))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body.unwrap()["url"], "http://10.6.0.1:80/7");
        let breaker = proxy.breakers().get("orders").await.unwrap();
        assert_eq!(
            breaker.config().failure_threshold,
            CircuitBreakerConfig::default().failure_threshold
        );
        proxy.dispose().await;
    }
}

// Integration tests for egress breaker keying and policy handling
mod common;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use meshgate::{
        CircuitBreakerRegistry, CircuitState, EgressProxy, EgressRequest, IngressProxy,
        IngressRequest, ServiceRegistry,
        config::{IngressRoute, InstanceRegistration, MeshGlobalConfig, MeshServiceConfig},
        ports::{ConfigurationManager, Transport},
    };

    use crate::common::{BrokenConfigManager, Reply, ScriptedTransport, config_manager};

    async fn tight_policy(config: &dyn ConfigurationManager, name: &str) {
        config
            .update_service_config(
                name,
                MeshServiceConfig {
                    failure_threshold: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_named_policy_shares_one_breaker_across_hosts() {
        let transport = ScriptedTransport::new();
        let config = config_manager();
        tight_policy(config.as_ref(), "p1").await;
        transport.reply("alpha.internal:8080", Reply::Status(502));

        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let proxy = EgressProxy::new(config, dyn_transport);

        for _ in 0..2 {
            let response = proxy
                .handle_request(EgressRequest::new("alpha.internal", 8080).with_policy("p1"))
                .await;
            assert_eq!(response.status_code, 502);
        }

        // beta is healthy but shares p1, so it is rejected without a call
        let response = proxy
            .handle_request(EgressRequest::new("beta.internal", 8080).with_policy("p1"))
            .await;
        assert_eq!(response.status_code, 503);
        assert_eq!(response.body.as_ref().unwrap()["error"], "Circuit Open");
        assert_eq!(transport.calls_to("beta.internal:8080"), 0);
        assert_eq!(proxy.breakers().len(), 1);

        // Without a policy beta gets its own breaker and goes through
        let response = proxy
            .handle_request(EgressRequest::new("beta.internal", 8080))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(proxy.breakers().len(), 2);
        assert!(proxy.breakers().get("beta.internal:8080").await.is_some());

        proxy.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_host_port_keys_isolate_targets() {
        let transport = ScriptedTransport::new();
        transport.reply("flaky:81", Reply::Refused);
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let proxy = EgressProxy::new(config_manager(), dyn_transport);

        for _ in 0..5 {
            proxy.handle_request(EgressRequest::new("flaky", 81)).await;
        }
        let flaky = proxy.breakers().get("flaky:81").await.unwrap();
        assert_eq!(flaky.state(), CircuitState::Open);

        let response = proxy
            .handle_request(EgressRequest::new("steady", 81).with_path("/status"))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body.unwrap()["url"], "http://steady:81/status");
        proxy.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_target_is_rejected_before_any_call() {
        let transport = ScriptedTransport::new();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let proxy = EgressProxy::new(config_manager(), dyn_transport);

        let response = proxy.handle_request(EgressRequest::new("", 80)).await;
        assert_eq!(response.status_code, 400);
        let response = proxy.handle_request(EgressRequest::new("api", 0)).await;
        assert_eq!(response.status_code, 400);
        assert!(transport.calls().is_empty());
        assert!(proxy.breakers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retries_follow_global_policy() {
        let transport = ScriptedTransport::new();
        transport.reply("retry.me:80", Reply::Status(500));
        let config = config_manager();
        config
            .update_global_config(MeshGlobalConfig {
                default_timeout_ms: 1_000,
                default_retries: 2,
            })
            .await
            .unwrap();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let proxy = EgressProxy::new(config, dyn_transport);

        let response = proxy
            .handle_request(EgressRequest::new("retry.me", 80))
            .await;
        assert_eq!(response.status_code, 502);
        assert_eq!(transport.calls_to("retry.me:80"), 3);
        proxy.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shared_registry_links_ingress_and_egress() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register_service("ledger", InstanceRegistration::new("l1", "10.9.0.1", 7000));
        let transport = ScriptedTransport::new();
        transport.reply("10.9.0.1:7000", Reply::Status(500));
        let config = config_manager();
        tight_policy(config.as_ref(), "ledger").await;

        let breakers = CircuitBreakerRegistry::shared();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let ingress = IngressProxy::new(
            vec![IngressRoute::new("/ledger", "ledger")],
            registry,
            config.clone(),
            dyn_transport.clone(),
        )
        .with_breakers(breakers.clone());
        let egress = EgressProxy::new(config, dyn_transport).with_breakers(breakers.clone());

        for _ in 0..2 {
            let response = ingress
                .handle_request(IngressRequest::new("GET", "/ledger"))
                .await;
            assert_eq!(response.status_code, 502);
        }

        let response = egress
            .handle_request(EgressRequest::new("10.9.0.1", 7000).with_policy("ledger"))
            .await;
        assert_eq!(response.status_code, 503);
        assert_eq!(breakers.len(), 1);
        assert_eq!(transport.calls_to("10.9.0.1:7000"), 2);
        breakers.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_timeout_overrides_global_default() {
        let transport = ScriptedTransport::new();
        transport.reply("slow.internal:80", Reply::Stall(2_000));
        let config = config_manager();
        config
            .update_global_config(MeshGlobalConfig {
                default_timeout_ms: 30_000,
                default_retries: 0,
            })
            .await
            .unwrap();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let proxy = EgressProxy::new(config, dyn_transport);

        let started = std::time::Instant::now();
        let response = proxy
            .handle_request(EgressRequest::new("slow.internal", 80).with_timeout_ms(50))
            .await;
        assert!(started.elapsed() < std::time::Duration::from_millis(1_500));
        assert_eq!(response.status_code, 502);
        let details = response.body.unwrap()["details"].as_str().unwrap().to_string();
        assert!(details.contains("Timeout"), "{details}");
        assert_eq!(transport.calls_to("slow.internal:80"), 1);
        proxy.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_timeout_is_rejected_before_any_call() {
        let transport = ScriptedTransport::new();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let proxy = EgressProxy::new(config_manager(), dyn_transport);

        let response = proxy
            .handle_request(EgressRequest::new("api", 80).with_timeout_ms(0))
            .await;
        assert_eq!(response.status_code, 400);
        assert_eq!(response.body.as_ref().unwrap()["error"], "Bad Request");
        assert!(transport.calls().is_empty());
        assert!(proxy.breakers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_policy_store_uses_defaults() {
        let transport = ScriptedTransport::new();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let proxy = EgressProxy::new(Arc::new(BrokenConfigManager), dyn_transport);

        let response = proxy
            .handle_request(
                EgressRequest::new("billing.internal", 8443)
                    .with_path("/invoices")
                    .with_policy("billing"),
            )
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body.unwrap()["url"], "http://billing.internal:8443/invoices");
        assert!(proxy.breakers().get("billing").await.is_some());
        proxy.dispose().await;
    }
}

//! Composition root for the mesh: owns the service registry and the
//! configuration source, and exposes the administrative operations.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    config::{
        models::{InstanceRegistration, MeshGlobalConfig, MeshServiceConfig},
        validation::{MeshConfigValidator, ValidationResult},
    },
    core::registry::{ServiceDefinition, ServiceInstance, ServiceRegistry},
    ports::{ConfigError, ConfigResult, ConfigurationManager},
    tracing_setup::configure_component_tracing,
};

pub struct ControlPlane {
    registry: Arc<ServiceRegistry>,
    config: Arc<dyn ConfigurationManager>,
    heartbeat_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn new(registry: Arc<ServiceRegistry>, config: Arc<dyn ConfigurationManager>) -> Self {
        Self {
            registry,
            config,
            heartbeat_monitor: Mutex::new(None),
        }
    }

    /// Registry handle for building proxies.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Configuration source handle for building proxies.
    pub fn config_manager(&self) -> &Arc<dyn ConfigurationManager> {
        &self.config
    }

    /// Register an instance after checking its ids, host and port.
    pub fn register_service(
        &self,
        service_id: &str,
        registration: InstanceRegistration,
    ) -> ValidationResult<ServiceInstance> {
        if let Err(e) = MeshConfigValidator::validate_registration(service_id, &registration) {
            tracing::warn!(service_id, error = %e, "Rejected instance registration");
            return Err(e);
        }
        tracing::info!(service_id, registration = ?registration, "Registering service instance");
        Ok(self.registry.register_service(service_id, registration))
    }

    pub fn deregister_service(&self, service_id: &str, instance_id: &str) -> bool {
        tracing::info!(service_id, instance_id, "Deregistering service instance");
        self.registry.deregister_service(service_id, instance_id)
    }

    pub fn get_service_endpoints(&self, service_id: &str) -> Vec<ServiceInstance> {
        tracing::debug!(service_id, "Listing service endpoints");
        self.registry.get_service_endpoints(service_id)
    }

    pub fn get_all_services(&self) -> HashMap<String, ServiceDefinition> {
        tracing::debug!("Listing all services");
        self.registry.get_all_services()
    }

    pub fn update_service_metadata(
        &self,
        service_id: &str,
        instance_id: &str,
        metadata: HashMap<String, String>,
    ) -> bool {
        tracing::info!(service_id, instance_id, metadata = ?metadata, "Updating instance metadata");
        self.registry
            .update_service_metadata(service_id, instance_id, metadata)
    }

    pub fn heartbeat(&self, service_id: &str, instance_id: &str) -> bool {
        tracing::debug!(service_id, instance_id, "Heartbeat received");
        self.registry.heartbeat(service_id, instance_id)
    }

    /// Validate and store the global policy. Invalid input never reaches the source.
    pub async fn update_global_configuration(&self, config: MeshGlobalConfig) -> ConfigResult<()> {
        MeshConfigValidator::validate_global(&config).map_err(rejected)?;
        tracing::info!(config = ?config, "Updating global configuration");
        self.config.update_global_config(config).await
    }

    pub async fn update_service_configuration(
        &self,
        service_id: &str,
        config: MeshServiceConfig,
    ) -> ConfigResult<()> {
        MeshConfigValidator::validate_service_policy(service_id, &config).map_err(rejected)?;
        tracing::info!(service_id, config = ?config, "Updating service configuration");
        self.config.update_service_config(service_id, config).await
    }

    /// Periodically mark instances whose heartbeat is older than `ttl` as DOWN.
    /// Replaces a monitor started earlier. Needs a tokio runtime; without one
    /// the call is logged and ignored.
    pub fn start_heartbeat_monitor(&self, ttl: Duration, interval: Duration) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime, heartbeat monitor not started");
            return false;
        };

        let registry = Arc::downgrade(&self.registry);
        let span = configure_component_tracing("heartbeat_monitor");
        let task = handle.spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    let expired = registry.expire_stale(ttl);
                    if expired > 0 {
                        tracing::warn!(
                            expired,
                            ttl_secs = ttl.as_secs(),
                            "Expired stale instances"
                        );
                    }
                }
            }
            .instrument(span),
        );

        let mut monitor = self.heartbeat_monitor.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = monitor.replace(task) {
            previous.abort();
        }
        tracing::info!(
            ttl_secs = ttl.as_secs(),
            interval_secs = interval.as_secs(),
            "Heartbeat monitor started"
        );
        true
    }

    pub fn heartbeat_monitor_running(&self) -> bool {
        self.heartbeat_monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop background work and drop every change subscriber. Idempotent.
    pub fn dispose(&self) {
        if let Some(task) = self
            .heartbeat_monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        self.registry.clear_listeners();
        tracing::info!("Control plane disposed");
    }
}

fn rejected(error: crate::config::ValidationError) -> ConfigError {
    tracing::warn!(error = %error, "Rejected configuration update");
    ConfigError::Invalid(error.to_string())
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        if let Some(task) = self
            .heartbeat_monitor
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

//! In-memory service registry.
//!
//! Maps service ids to their live instances and notifies subscribers of every
//! change. Definitions are created lazily on first registration and retained
//! after their last instance leaves, so `get_all_services` keeps reporting a
//! service that is known but currently empty.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::models::InstanceRegistration;

/// Instance health as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Up => write!(f, "UP"),
            InstanceStatus::Down => write!(f, "DOWN"),
            InstanceStatus::Starting => write!(f, "STARTING"),
            InstanceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One network endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    /// Relative share for weighted round robin (minimum 1)
    pub weight: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

impl ServiceInstance {
    fn from_registration(registration: InstanceRegistration) -> Self {
        Self {
            id: registration.id,
            host: registration.host,
            port: registration.port,
            version: registration.version,
            tags: registration.tags,
            metadata: registration.metadata,
            weight: registration.weight.unwrap_or(1).max(1),
            last_heartbeat: Utc::now(),
            status: InstanceStatus::Up,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }
}

/// All instances of one service, ordered by instance id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub service_id: String,
    pub instances: BTreeMap<String, ServiceInstance>,
}

impl ServiceDefinition {
    fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            instances: BTreeMap::new(),
        }
    }
}

/// Kind of registry change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryEventKind {
    Register,
    Deregister,
    MetadataUpdate,
    StatusChange,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub service_id: String,
    pub instance: Option<ServiceInstance>,
    pub definition: Option<ServiceDefinition>,
}

pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

type ListenerList = Mutex<Vec<(u64, RegistryListener)>>;

/// Handle returned by [`ServiceRegistry::subscribe_to_changes`].
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    /// Remove exactly the listener this handle was created for.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners.lock().unwrap_or_else(|p| p.into_inner());
            guard.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Service id → instances directory with change notification.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceDefinition>>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Upsert an instance, marking it UP with a fresh heartbeat.
    pub fn register_service(
        &self,
        service_id: &str,
        registration: InstanceRegistration,
    ) -> ServiceInstance {
        let instance = ServiceInstance::from_registration(registration);
        let definition = {
            let mut services = self.write();
            let definition = services
                .entry(service_id.to_string())
                .or_insert_with(|| ServiceDefinition::new(service_id));
            let replaced = definition
                .instances
                .insert(instance.id.clone(), instance.clone())
                .is_some();
            tracing::info!(
                service_id,
                instance_id = %instance.id,
                address = %instance.address(),
                replaced,
                "Registered service instance"
            );
            definition.clone()
        };

        self.emit(RegistryEvent {
            kind: RegistryEventKind::Register,
            service_id: service_id.to_string(),
            instance: Some(instance.clone()),
            definition: Some(definition),
        });
        instance
    }

    /// Remove an instance. Unknown service or instance is a logged no-op.
    pub fn deregister_service(&self, service_id: &str, instance_id: &str) -> bool {
        let removed = {
            let mut services = self.write();
            let Some(definition) = services.get_mut(service_id) else {
                tracing::warn!(service_id, instance_id, "Deregister for unknown service");
                return false;
            };
            let Some(instance) = definition.instances.remove(instance_id) else {
                tracing::warn!(service_id, instance_id, "Deregister for unknown instance");
                return false;
            };
            tracing::info!(
                service_id,
                instance_id,
                remaining = definition.instances.len(),
                "Deregistered service instance"
            );
            (instance, definition.clone())
        };

        let (instance, definition) = removed;
        self.emit(RegistryEvent {
            kind: RegistryEventKind::Deregister,
            service_id: service_id.to_string(),
            instance: Some(instance),
            definition: Some(definition),
        });
        true
    }

    /// UP instances of a service; empty for unknown services.
    pub fn get_service_endpoints(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.read()
            .get(service_id)
            .map(|definition| {
                definition
                    .instances
                    .values()
                    .filter(|instance| instance.is_up())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_service(&self, service_id: &str) -> Option<ServiceDefinition> {
        self.read().get(service_id).cloned()
    }

    /// Snapshot of every known service, including empty ones.
    pub fn get_all_services(&self) -> HashMap<String, ServiceDefinition> {
        self.read().clone()
    }

    /// Merge `metadata` into the instance's map and refresh its heartbeat.
    pub fn update_service_metadata(
        &self,
        service_id: &str,
        instance_id: &str,
        metadata: HashMap<String, String>,
    ) -> bool {
        let updated = self.mutate_instance(service_id, instance_id, |instance| {
            instance.metadata.extend(metadata);
            instance.last_heartbeat = Utc::now();
            true
        });
        match updated {
            Some((instance, definition)) => {
                tracing::debug!(service_id, instance_id, "Updated instance metadata");
                self.emit(RegistryEvent {
                    kind: RegistryEventKind::MetadataUpdate,
                    service_id: service_id.to_string(),
                    instance: Some(instance),
                    definition: Some(definition),
                });
                true
            }
            None => {
                tracing::debug!(service_id, instance_id, "Metadata update for unknown instance");
                false
            }
        }
    }

    /// Refresh an instance's heartbeat. A DOWN or UNKNOWN instance comes back UP.
    pub fn heartbeat(&self, service_id: &str, instance_id: &str) -> bool {
        let mut revived = false;
        let updated = self.mutate_instance(service_id, instance_id, |instance| {
            instance.last_heartbeat = Utc::now();
            if matches!(instance.status, InstanceStatus::Down | InstanceStatus::Unknown) {
                instance.status = InstanceStatus::Up;
                revived = true;
            }
            revived
        });
        match updated {
            Some((instance, definition)) => {
                if revived {
                    tracing::info!(service_id, instance_id, "Instance back UP after heartbeat");
                    self.emit(RegistryEvent {
                        kind: RegistryEventKind::StatusChange,
                        service_id: service_id.to_string(),
                        instance: Some(instance),
                        definition: Some(definition),
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Set an instance's status, notifying only on an actual change.
    pub fn set_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> bool {
        let mut changed = false;
        let updated = self.mutate_instance(service_id, instance_id, |instance| {
            changed = instance.status != status;
            instance.status = status;
            changed
        });
        match updated {
            Some((instance, definition)) => {
                if changed {
                    tracing::info!(service_id, instance_id, %status, "Instance status changed");
                    self.emit(RegistryEvent {
                        kind: RegistryEventKind::StatusChange,
                        service_id: service_id.to_string(),
                        instance: Some(instance),
                        definition: Some(definition),
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Mark UP instances whose last heartbeat is older than `ttl` as DOWN.
    /// Returns how many instances were expired.
    pub fn expire_stale(&self, ttl: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };

        let mut expired = Vec::new();
        {
            let mut services = self.write();
            for definition in services.values_mut() {
                for instance in definition.instances.values_mut() {
                    if instance.is_up() && instance.last_heartbeat < cutoff {
                        instance.status = InstanceStatus::Down;
                        expired.push((definition.service_id.clone(), instance.clone()));
                    }
                }
            }
        }

        for (service_id, instance) in &expired {
            tracing::warn!(
                service_id = %service_id,
                instance_id = %instance.id,
                last_heartbeat = %instance.last_heartbeat,
                "Instance missed heartbeat, marking DOWN"
            );
            self.emit(RegistryEvent {
                kind: RegistryEventKind::StatusChange,
                service_id: service_id.clone(),
                instance: Some(instance.clone()),
                definition: self.get_service(service_id),
            });
        }
        expired.len()
    }

    /// Subscribe to every register / deregister / metadata / status change.
    pub fn subscribe_to_changes<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drop every subscriber.
    pub fn clear_listeners(&self) {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Apply `change` to one instance under the write lock. Returns clones of
    /// the instance and its definition when the instance exists.
    fn mutate_instance<F>(
        &self,
        service_id: &str,
        instance_id: &str,
        change: F,
    ) -> Option<(ServiceInstance, ServiceDefinition)>
    where
        F: FnOnce(&mut ServiceInstance) -> bool,
    {
        let mut services = self.write();
        let definition = services.get_mut(service_id)?;
        let instance = definition.instances.get_mut(instance_id)?;
        change(instance);
        let instance = instance.clone();
        Some((instance, definition.clone()))
    }

    /// Deliver an event to every listener. Runs without the registry lock so
    /// listeners may call back into the registry; a panicking listener is
    /// logged and does not stop the others.
    fn emit(&self, event: RegistryEvent) {
        let listeners: Vec<(u64, RegistryListener)> = self
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!(
                    listener_id = id,
                    service_id = %event.service_id,
                    kind = ?event.kind,
                    "Registry listener panicked"
                );
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ServiceDefinition>> {
        self.services.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ServiceDefinition>> {
        self.services.write().unwrap_or_else(|p| p.into_inner())
    }
}

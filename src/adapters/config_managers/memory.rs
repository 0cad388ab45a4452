use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;

use crate::{
    config::models::{MeshConfig, MeshGlobalConfig, MeshServiceConfig},
    ports::config_manager::{ConfigResult, ConfigurationManager},
};

/// Process-local policy store, seeded from the file configuration.
#[derive(Default)]
pub struct InMemoryConfigManager {
    global: RwLock<MeshGlobalConfig>,
    services: RwLock<HashMap<String, MeshServiceConfig>>,
}

impl InMemoryConfigManager {
    pub fn new(global: MeshGlobalConfig, services: HashMap<String, MeshServiceConfig>) -> Self {
        Self {
            global: RwLock::new(global),
            services: RwLock::new(services),
        }
    }

    pub fn from_config(config: &MeshConfig) -> Self {
        Self::new(config.global.clone(), config.services.clone())
    }

    fn services(&self) -> RwLockReadGuard<'_, HashMap<String, MeshServiceConfig>> {
        self.services.read().unwrap_or_else(|p| p.into_inner())
    }

    fn services_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, MeshServiceConfig>> {
        self.services.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ConfigurationManager for InMemoryConfigManager {
    async fn get_global_config(&self) -> ConfigResult<MeshGlobalConfig> {
        Ok(self.global.read().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn get_service_config(&self, id: &str) -> ConfigResult<MeshServiceConfig> {
        Ok(self.services().get(id).cloned().unwrap_or_default())
    }

    async fn update_global_config(&self, config: MeshGlobalConfig) -> ConfigResult<()> {
        *self.global.write().unwrap_or_else(|p| p.into_inner()) = config;
        Ok(())
    }

    async fn update_service_config(&self, id: &str, config: MeshServiceConfig) -> ConfigResult<()> {
        self.services_mut().insert(id.to_string(), config);
        Ok(())
    }
}

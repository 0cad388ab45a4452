use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use url::Url;

use crate::{
    config::models::{MeshGlobalConfig, MeshServiceConfig},
    ports::config_manager::{ConfigError, ConfigResult, ConfigurationManager},
};

/// Policy store backed by a remote configuration service.
///
/// Layout under `base_url`:
/// * `GET/PUT {base}/global`
/// * `GET/PUT {base}/services/{id}` (a 404 on GET means "no overrides")
///
/// The id is always one percent-encoded path segment.
pub struct HttpConfigManager {
    base_url: Url,
    client: Client,
}

impl HttpConfigManager {
    pub fn new(base_url: &str, request_timeout: Duration) -> ConfigResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ConfigError::Invalid(format!("policy store url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "policy store url {base_url} cannot carry a path"
            )));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Unavailable(format!("failed to build client: {e}")))?;
        tracing::info!(base_url = %base_url, "Created remote policy store client");
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, segments: &[&str]) -> ConfigResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConfigError::Invalid(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn global_url(&self) -> ConfigResult<Url> {
        self.endpoint(&["global"])
    }

    fn service_url(&self, id: &str) -> ConfigResult<Url> {
        self.endpoint(&["services", id])
    }

    async fn fetch<T: DeserializeOwned + Default>(&self, url: Url) -> ConfigResult<T> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ConfigError::Unavailable(format!("GET {url}: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(T::default());
        }
        if !resp.status().is_success() {
            return Err(ConfigError::Unavailable(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ConfigError::InvalidPayload(format!("GET {url}: {e}")))
    }

    async fn store<T: Serialize + Sync>(&self, url: Url, body: &T) -> ConfigResult<()> {
        let resp = self
            .client
            .put(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| ConfigError::Unavailable(format!("PUT {url}: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ConfigError::Rejected(format!(
                "PUT {url} returned {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl ConfigurationManager for HttpConfigManager {
    async fn get_global_config(&self) -> ConfigResult<MeshGlobalConfig> {
        self.fetch(self.global_url()?).await
    }

    async fn get_service_config(&self, id: &str) -> ConfigResult<MeshServiceConfig> {
        self.fetch(self.service_url(id)?).await
    }

    async fn update_global_config(&self, config: MeshGlobalConfig) -> ConfigResult<()> {
        self.store(self.global_url()?, &config).await
    }

    async fn update_service_config(&self, id: &str, config: MeshServiceConfig) -> ConfigResult<()> {
        self.store(self.service_url(id)?, &config).await
    }
}

// Shared in-process doubles for the integration tests
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use meshgate::{
    adapters::InMemoryConfigManager,
    config::{MeshGlobalConfig, MeshServiceConfig},
    ports::{
        ConfigError, ConfigResult, ConfigurationManager, Transport, TransportError,
        TransportRequest, TransportResponse, TransportResult,
    },
};
use serde_json::json;

/// What a scripted upstream answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Status(u16),
    Refused,
    /// Answer 200 after holding the call for this many milliseconds
    Stall(u64),
}

/// Transport whose answers are scripted per `host:port`.
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn reply(&self, authority: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(authority.to_string(), reply);
    }

    /// Every URL requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, authority: &str) -> usize {
        self.calls()
            .iter()
            .filter(|url| authority_of(url) == authority)
            .count()
    }
}

fn authority_of(url: &str) -> String {
    let parsed = url::Url::parse(url).expect("transport saw an invalid url");
    format!(
        "{}:{}",
        parsed.host_str().unwrap_or_default(),
        parsed.port_or_known_default().unwrap_or_default()
    )
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, req: TransportRequest) -> TransportResult<TransportResponse> {
        self.calls.lock().unwrap().push(req.url.clone());
        let authority = authority_of(&req.url);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&authority)
            .copied()
            .unwrap_or(Reply::Status(200));

        let status = match reply {
            Reply::Status(status) => status,
            Reply::Refused => {
                return Err(TransportError::ConnectionError(format!(
                    "connection refused: {authority}"
                )));
            }
            Reply::Stall(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                200
            }
        };

        Ok(TransportResponse {
            status,
            status_text: String::new(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            data: json!({ "served_by": authority, "url": req.url }),
            raw_body: None,
        })
    }
}

pub fn config_manager() -> Arc<InMemoryConfigManager> {
    Arc::new(InMemoryConfigManager::default())
}

/// Policy store that is never reachable.
pub struct BrokenConfigManager;

#[async_trait]
impl ConfigurationManager for BrokenConfigManager {
    async fn get_global_config(&self) -> ConfigResult<MeshGlobalConfig> {
        Err(ConfigError::Unavailable("store offline".into()))
    }

    async fn get_service_config(&self, _id: &str) -> ConfigResult<MeshServiceConfig> {
        Err(ConfigError::Unavailable("store offline".into()))
    }

    async fn update_global_config(&self, _config: MeshGlobalConfig) -> ConfigResult<()> {
        Err(ConfigError::Unavailable("store offline".into()))
    }

    async fn update_service_config(
        &self,
        _id: &str,
        _config: MeshServiceConfig,
    ) -> ConfigResult<()> {
        Err(ConfigError::Unavailable("store offline".into()))
    }
}

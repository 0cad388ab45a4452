use async_trait::async_trait;
use thiserror::Error;

use crate::config::models::{MeshGlobalConfig, MeshServiceConfig};

/// Errors raised by configuration sources
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The backing store could not be reached
    #[error("Configuration source unavailable: {0}")]
    Unavailable(String),

    /// The source answered with something that is not a valid policy
    #[error("Invalid configuration payload: {0}")]
    InvalidPayload(String),

    /// The source refused the update
    #[error("Configuration update rejected: {0}")]
    Rejected(String),

    /// The update failed validation and never reached the source
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// ConfigurationManager defines the port (interface) to the policy store.
///
/// The mesh core only reads through it (to size breakers and timeouts) and
/// only writes through the control plane's administrative calls.
#[async_trait]
pub trait ConfigurationManager: Send + Sync + 'static {
    /// Mesh-wide defaults.
    async fn get_global_config(&self) -> ConfigResult<MeshGlobalConfig>;

    /// Overrides for a service id or egress policy name. Unknown ids yield an
    /// empty policy rather than an error.
    async fn get_service_config(&self, id: &str) -> ConfigResult<MeshServiceConfig>;

    async fn update_global_config(&self, config: MeshGlobalConfig) -> ConfigResult<()>;

    async fn update_service_config(&self, id: &str, config: MeshServiceConfig)
    -> ConfigResult<()>;
}

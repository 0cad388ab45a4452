use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::{models::MeshConfig, validation::MeshConfigValidator};

/// Prefix of environment variables layered over the file, e.g.
/// `MESHGATE__LISTEN_ADDR` or `MESHGATE__GLOBAL__DEFAULT_RETRIES`.
pub const ENV_PREFIX: &str = "MESHGATE";

fn file_format(path: &Path) -> Result<FileFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(FileFormat::Json),
        Some("toml") => Ok(FileFormat::Toml),
        Some("yaml" | "yml") | None => Ok(FileFormat::Yaml),
        Some(other) => Err(eyre::eyre!(
            "Unsupported config format '.{other}' for {}",
            path.display()
        )),
    }
}

/// Parse a mesh config file, with `MESHGATE__*` variables taking precedence.
/// The result is not validated; see [`load_validated_config`].
pub async fn load_config(config_path: &str) -> Result<MeshConfig> {
    load_config_sync(config_path)
}

pub fn load_config_sync(config_path: &str) -> Result<MeshConfig> {
    let path = Path::new(config_path);
    let format = file_format(path)?;

    let settings = Config::builder()
        .add_source(File::new(config_path, format))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))
}

/// Load and validate in one step. Every validation problem is reported at once.
pub async fn load_validated_config(config_path: &str) -> Result<MeshConfig> {
    let config = load_config(config_path).await?;
    MeshConfigValidator::validate(&config)
        .with_context(|| format!("Invalid configuration in {config_path}"))?;
    tracing::debug!(
        path = config_path,
        routes = config.routes.len(),
        services = config.services.len(),
        "Configuration loaded"
    );
    Ok(config)
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::processor::ProcessorConfig;
use crate::recovery::RecoveryConfig;

/// Environment variable naming a JSON configuration file
pub const CONFIG_PATH_ENV: &str = "CONTACT_SYNC_CONFIG_PATH";

/// Complete configuration of the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Retry, backoff and per-operation breaker settings
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Defaults for breakers created without an explicit configuration
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default = "ProcessorConfig::from_env")]
    pub processor: ProcessorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recovery: RecoveryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            processor: ProcessorConfig::from_env(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        self.recovery.validate().context("invalid recovery configuration")?;
        self.breaker.validate().context("invalid circuit breaker configuration")?;
        Ok(())
    }
}

/// Load the configuration.
///
/// Reads the file named by `CONTACT_SYNC_CONFIG_PATH` when it is set and
/// exists; otherwise every value comes from the environment or its default.
pub fn load_config() -> Result<SyncConfig> {
    let config = match config_path() {
        Some(path) if path.exists() => load_config_from(&path)?,
        Some(path) => {
            info!("No configuration file at {}, using defaults", path.display());
            SyncConfig::default()
        }
        None => {
            debug!("{} not set, using defaults", CONFIG_PATH_ENV);
            SyncConfig::default()
        }
    };

    config.validate()?;
    Ok(config)
}

/// Load and validate a configuration file
pub fn load_config_from(path: &Path) -> Result<SyncConfig> {
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;
    let config: SyncConfig = serde_json::from_str(&config_str)
        .with_context(|| format!("failed to parse configuration in {}", path.display()))?;
    config.validate()?;
    debug!("Loaded configuration from {}", path.display());

    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
}

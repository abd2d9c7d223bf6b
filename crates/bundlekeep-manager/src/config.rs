use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context};
use bundlekeep_core::{DEFAULT_CATALOG_URL, DEFAULT_CHANNEL};
use serde::Deserialize;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Optional `<base>/bundlekeep/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ManagerConfig {
    pub default_channel: String,
    pub backend: Option<String>,
    pub catalog_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_channel: DEFAULT_CHANNEL.to_string(),
            backend: None,
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse bundlekeep config")?;
        if config.default_channel.trim().is_empty() {
            return Err(anyhow!("default_channel must not be empty"));
        }
        if config.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than zero"));
        }
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)
                .with_context(|| format!("invalid config {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

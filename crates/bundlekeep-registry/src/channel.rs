use std::time::Duration;

use anyhow::Result;
use bundlekeep_core::normalize_plugin_names;
pub use bundlekeep_core::DEFAULT_CATALOG_URL;
use bundlekeep_resolver::VersionSource;
use reqwest::blocking::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::plugins::parse_plugin_catalog;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid catalog payload from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// Blocking client for a channel catalog service (`<base>/package/<channel>/<name>`).
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    client: Client,
    base_url: String,
}

impl ChannelRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bundlekeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RegistryError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn package_url(&self, channel: &str, package_name: &str) -> String {
        format!("{}/package/{channel}/{package_name}", self.base_url)
    }

    pub fn fetch_plugin_names(&self, url: &str) -> Result<Vec<String>, RegistryError> {
        let payload = self.fetch_json(url)?;
        let names = parse_plugin_catalog(&payload).map_err(|reason| RegistryError::Decode {
            url: url.to_string(),
            reason,
        })?;
        Ok(normalize_plugin_names(names))
    }

    fn fetch_json(&self, url: &str) -> Result<Value, RegistryError> {
        debug!(url, "fetching catalog");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|source| RegistryError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.json::<Value>().map_err(|err| RegistryError::Decode {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }
}

impl VersionSource for ChannelRegistry {
    fn package_versions(&self, package_name: &str, channel: &str) -> Result<Vec<String>> {
        let url = self.package_url(channel, package_name);
        let payload = self.fetch_json(&url)?;
        let versions = parse_package_versions(&payload)
            .map_err(|reason| RegistryError::Decode { url, reason })?;
        Ok(versions)
    }
}

/// Extracts the `versions` array of a package document; a missing key means none.
pub fn parse_package_versions(payload: &Value) -> Result<Vec<String>, String> {
    let Some(object) = payload.as_object() else {
        return Err("package document must be a JSON object".to_string());
    };
    let Some(versions) = object.get("versions") else {
        return Ok(Vec::new());
    };
    let Some(items) = versions.as_array() else {
        return Err("'versions' must be an array".to_string());
    };

    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(ToOwned::to_owned)
                .ok_or_else(|| format!("version entry must be a string: {item}"))
        })
        .collect()
}

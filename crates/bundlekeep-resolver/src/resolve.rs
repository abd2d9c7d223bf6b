use bundlekeep_core::{is_stable_version, is_update, sort_versions, DEFAULT_CHANNEL};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::VersionSource;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("catalog unavailable for '{package}' on channel '{channel}': {reason}")]
    CatalogUnavailable {
        package: String,
        channel: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub package_name: &'a str,
    pub channels: &'a [String],
    pub current_version: &'a str,
    pub include_dev: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub available_versions: Vec<String>,
    pub current_version: String,
    pub latest_version: String,
    pub previous_version: String,
    pub update: bool,
}

pub fn resolve<S: VersionSource>(
    source: &S,
    request: &ResolveRequest<'_>,
) -> Result<Resolution, ResolveError> {
    let default_channels = [DEFAULT_CHANNEL.to_string()];
    let channels = if request.channels.is_empty() {
        &default_channels[..]
    } else {
        request.channels
    };

    let mut raw = Vec::new();
    for channel in channels {
        let versions = source
            .package_versions(request.package_name, channel)
            .map_err(|err| ResolveError::CatalogUnavailable {
                package: request.package_name.to_string(),
                channel: channel.clone(),
                reason: format!("{err:#}"),
            })?;
        debug!(
            package = request.package_name,
            channel = channel.as_str(),
            count = versions.len(),
            "fetched channel versions"
        );
        raw.extend(versions);
    }

    let mut available = sort_versions(raw);
    if !request.include_dev {
        available.retain(|version| is_stable_version(version));
    }

    let latest_version = available.last().cloned().unwrap_or_default();
    let previous_version = previous_of(&available, request.current_version);
    let update = is_update(&latest_version, request.current_version);

    Ok(Resolution {
        available_versions: available,
        current_version: request.current_version.to_string(),
        latest_version,
        previous_version,
        update,
    })
}

fn previous_of(available: &[String], current: &str) -> String {
    available
        .iter()
        .position(|version| version == current)
        .and_then(|index| index.checked_sub(1))
        .map(|index| available[index].clone())
        .unwrap_or_default()
}

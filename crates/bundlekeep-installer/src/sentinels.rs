use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bundlekeep_core::sort_versions;
use serde::{Deserialize, Serialize};

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::layout::PrefixLayout;

/// Marker written only after an environment installed cleanly. Its absence means the
/// environment is unverified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentinel {
    pub package_name: String,
    pub version: String,
    #[serde(default)]
    pub build_string: String,
    #[serde(default)]
    pub plugins: Vec<String>,
    pub created_at_unix: u64,
}

pub fn write_sentinel(layout: &PrefixLayout, sentinel: &Sentinel) -> Result<PathBuf> {
    let path = layout.sentinel_path(&sentinel.package_name, &sentinel.version);
    let payload = serde_json::to_vec_pretty(sentinel).context("failed to encode sentinel")?;
    write_atomic(&path, &payload)?;
    Ok(path)
}

pub fn has_sentinel(layout: &PrefixLayout, package_name: &str, version: &str) -> bool {
    layout.sentinel_path(package_name, version).is_file()
}

pub fn read_sentinel(
    layout: &PrefixLayout,
    package_name: &str,
    version: &str,
) -> Result<Option<Sentinel>> {
    let path = layout.sentinel_path(package_name, version);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let sentinel = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse sentinel {}", path.display()))?;
    Ok(Some(sentinel))
}

/// Returns whether a sentinel was present.
pub fn remove_sentinel(layout: &PrefixLayout, package_name: &str, version: &str) -> Result<bool> {
    let path = layout.sentinel_path(package_name, version);
    remove_file_if_exists(&path).with_context(|| format!("failed to remove {}", path.display()))
}

/// Versions of `package_name` that carry a sentinel, ascending.
pub fn sentinel_versions(layout: &PrefixLayout, package_name: &str) -> Result<Vec<String>> {
    let dir = layout.sentinels_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|v| v.to_str()) != Some("json") {
            continue;
        }
        let raw =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let Ok(sentinel) = serde_json::from_slice::<Sentinel>(&raw) else {
            tracing::warn!(path = %path.display(), "ignoring unreadable sentinel");
            continue;
        };
        if sentinel.package_name == package_name {
            versions.push(sentinel.version);
        }
    }

    Ok(sort_versions(versions))
}

/// Verified installs: a sentinel and an environment directory both exist.
pub fn installed_versions(layout: &PrefixLayout, package_name: &str) -> Result<Vec<String>> {
    Ok(sentinel_versions(layout, package_name)?
        .into_iter()
        .filter(|version| layout.prefix_for(package_name, version).is_dir())
        .collect())
}

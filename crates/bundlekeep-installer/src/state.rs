use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bundlekeep_core::InstalledPackage;
use serde::{Deserialize, Serialize};

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::layout::PrefixLayout;

/// What was installed before an update started. Written before any mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSnapshot {
    pub application: String,
    pub current_version: String,
    pub target_version: String,
    pub packages: Vec<InstalledPackage>,
    pub channels: Vec<String>,
    pub dev: bool,
    pub plugins: Vec<String>,
    pub saved_at_unix: u64,
}

/// Paths a previous clean could not delete; retried by the next clean.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredDeletions {
    pub package_name: String,
    pub paths: Vec<PathBuf>,
}

pub fn save_snapshot(layout: &PrefixLayout, snapshot: &UpdateSnapshot) -> Result<PathBuf> {
    let path = layout.snapshot_path(&snapshot.application);
    let payload = serde_json::to_vec_pretty(snapshot).context("failed to encode snapshot")?;
    write_atomic(&path, &payload)?;
    Ok(path)
}

pub fn load_snapshot(layout: &PrefixLayout, package_name: &str) -> Result<Option<UpdateSnapshot>> {
    read_json(layout.snapshot_path(package_name))
}

pub fn save_deferred(layout: &PrefixLayout, deferred: &DeferredDeletions) -> Result<PathBuf> {
    let path = layout.deferred_path(&deferred.package_name);
    let payload =
        serde_json::to_vec_pretty(deferred).context("failed to encode deferred deletions")?;
    write_atomic(&path, &payload)?;
    Ok(path)
}

pub fn load_deferred(layout: &PrefixLayout, package_name: &str) -> Result<DeferredDeletions> {
    let deferred = read_json(layout.deferred_path(package_name))?;
    Ok(deferred.unwrap_or_else(|| DeferredDeletions {
        package_name: package_name.to_string(),
        paths: Vec::new(),
    }))
}

pub fn clear_deferred(layout: &PrefixLayout, package_name: &str) -> Result<()> {
    let path = layout.deferred_path(package_name);
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove {}", path.display()))?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: PathBuf) -> Result<Option<T>> {
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

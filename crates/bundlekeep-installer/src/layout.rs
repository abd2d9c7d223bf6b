use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Filesystem layout rooted at the base prefix of the package-manager installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixLayout {
    root: PathBuf,
}

impl PrefixLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    pub fn manager_dir(&self) -> PathBuf {
        self.root.join("bundlekeep")
    }

    pub fn sentinels_dir(&self) -> PathBuf {
        self.manager_dir().join("sentinels")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.manager_dir().join("state")
    }

    pub fn config_path(&self) -> PathBuf {
        self.manager_dir().join("config.toml")
    }

    /// `<base>/envs/<package>-<version>`; pure, does not touch the filesystem.
    pub fn prefix_for(&self, package_name: &str, version: &str) -> PathBuf {
        self.envs_dir().join(format!("{package_name}-{version}"))
    }

    pub fn sentinel_path(&self, package_name: &str, version: &str) -> PathBuf {
        self.sentinels_dir()
            .join(format!("{package_name}-{version}.json"))
    }

    pub fn snapshot_path(&self, package_name: &str) -> PathBuf {
        self.state_dir().join(format!("{package_name}.json"))
    }

    pub fn deferred_path(&self, package_name: &str) -> PathBuf {
        self.state_dir().join(format!("{package_name}-deferred.json"))
    }

    pub fn lock_path(&self, package_name: &str) -> PathBuf {
        self.manager_dir()
            .join(format!("{package_name}-updater.lock"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.envs_dir(),
            self.manager_dir(),
            self.sentinels_dir(),
            self.state_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_base_prefix() -> Result<PathBuf> {
    if let Some(prefix) = std::env::var_os("BUNDLEKEEP_PREFIX").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(prefix));
    }

    let conda_prefix = std::env::var_os("CONDA_PREFIX")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            anyhow!("neither BUNDLEKEEP_PREFIX nor CONDA_PREFIX is set; pass --prefix")
        })?;
    Ok(base_prefix_from_conda_prefix(Path::new(&conda_prefix)))
}

/// A prefix that owns an `envs/` directory is a base prefix; `<base>/envs/<name>` maps to `<base>`.
pub fn base_prefix_from_conda_prefix(prefix: &Path) -> PathBuf {
    if prefix.join("envs").is_dir() {
        return prefix.to_path_buf();
    }

    if let Some(parent) = prefix.parent() {
        if parent.file_name().and_then(|v| v.to_str()) == Some("envs") {
            if let Some(base) = parent.parent() {
                return base.to_path_buf();
            }
        }
    }

    prefix.to_path_buf()
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::layout::PrefixLayout;
use crate::sentinels::has_sentinel;

const BROKEN_SUFFIX: &str = "-broken";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("environment does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to {action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub package_name: String,
    pub version: String,
    pub prefix: PathBuf,
    pub quarantined: bool,
}

/// Every `<package>-<version>` directory under `envs/`, quarantined ones included.
pub fn list_environments(
    layout: &PrefixLayout,
    package_name: &str,
) -> Result<Vec<Environment>, LifecycleError> {
    let envs_dir = layout.envs_dir();
    let entries = match fs::read_dir(&envs_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LifecycleError::Filesystem {
                action: "read",
                path: envs_dir,
                source,
            })
        }
    };

    let mut environments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LifecycleError::Filesystem {
            action: "read",
            path: envs_dir.clone(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(dir_name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if let Some((version, quarantined)) = parse_environment_name(package_name, dir_name) {
            environments.push(Environment {
                package_name: package_name.to_string(),
                version,
                prefix: path,
                quarantined,
            });
        }
    }

    environments.sort_by(|left, right| left.prefix.cmp(&right.prefix));
    Ok(environments)
}

/// Quarantined environments plus any environment without a sentinel.
pub fn list_broken(
    layout: &PrefixLayout,
    package_name: &str,
) -> Result<Vec<PathBuf>, LifecycleError> {
    Ok(list_environments(layout, package_name)?
        .into_iter()
        .filter(|environment| {
            environment.quarantined || !has_sentinel(layout, package_name, &environment.version)
        })
        .map(|environment| environment.prefix)
        .collect())
}

/// Renames `prefix` to `<prefix>-broken`, or `<prefix>-broken-N` when that is taken.
pub fn quarantine(prefix: &Path) -> Result<PathBuf, LifecycleError> {
    if !prefix.exists() {
        return Err(LifecycleError::NotFound(prefix.to_path_buf()));
    }

    let target = quarantine_target(prefix);
    fs::rename(prefix, &target).map_err(|source| LifecycleError::Filesystem {
        action: "quarantine",
        path: prefix.to_path_buf(),
        source,
    })?;
    info!(from = %prefix.display(), to = %target.display(), "quarantined environment");
    Ok(target)
}

/// Moves a quarantined environment back to `prefix`. Whatever occupies `prefix` is
/// quarantined first; its new path is returned.
pub fn reinstate(quarantined: &Path, prefix: &Path) -> Result<Option<PathBuf>, LifecycleError> {
    if !quarantined.exists() {
        return Err(LifecycleError::NotFound(quarantined.to_path_buf()));
    }
    let displaced = if prefix.exists() {
        Some(quarantine(prefix)?)
    } else {
        None
    };

    fs::rename(quarantined, prefix).map_err(|source| LifecycleError::Filesystem {
        action: "reinstate",
        path: quarantined.to_path_buf(),
        source,
    })?;
    info!(from = %quarantined.display(), to = %prefix.display(), "reinstated environment");
    Ok(displaced)
}

pub fn delete_environment(path: &Path) -> Result<(), LifecycleError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(LifecycleError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(LifecycleError::Filesystem {
                action: "inspect",
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|source| LifecycleError::Filesystem {
        action: "delete",
        path: path.to_path_buf(),
        source,
    })
}

fn quarantine_target(prefix: &Path) -> PathBuf {
    let mut base = prefix.as_os_str().to_owned();
    base.push(BROKEN_SUFFIX);
    let first = PathBuf::from(&base);
    if !first.exists() {
        return first;
    }

    let mut index = 1_u32;
    loop {
        let mut candidate = base.clone();
        candidate.push(format!("-{index}"));
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            return candidate;
        }
        index += 1;
    }
}

/// Splits `<package>-<version>[-broken[-N]]`. Versions start with a digit so that
/// `napari-svg-...` is never read as a `napari` environment.
pub(crate) fn parse_environment_name(package_name: &str, dir_name: &str) -> Option<(String, bool)> {
    let rest = dir_name.strip_prefix(package_name)?.strip_prefix('-')?;

    let (version, quarantined) = match rest.find(BROKEN_SUFFIX) {
        Some(index) => {
            let suffix = &rest[index + BROKEN_SUFFIX.len()..];
            let valid_suffix = suffix.is_empty()
                || suffix
                    .strip_prefix('-')
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
            if !valid_suffix {
                return None;
            }
            (&rest[..index], true)
        }
        None => (rest, false),
    };

    if !version.starts_with(|c: char| c.is_ascii_digit()) || version.contains('-') {
        return None;
    }
    Some((version.to_string(), quarantined))
}

use anyhow::{Context, Result};
use bundlekeep_core::{normalize_plugin_names, normalized_name, VersionSpec};
use bundlekeep_installer::{
    installed_versions, InstallerError, JobId, LockError, PackageBackend, PrefixLayout,
    ProcessLock,
};
use bundlekeep_resolver::{resolve, Resolution, ResolveError, ResolveRequest, VersionSource};
use tracing::{debug, info, warn};

use crate::outcome::{Exclusion, Locked};
use crate::update::UpdatePhase;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Empty means the default channel.
    pub channels: Vec<String>,
    pub include_dev: bool,
    /// Overrides every other source of the current version.
    pub current_version: Option<String>,
    /// Candidate plugin names; installed packages matching one are carried across updates.
    pub plugin_catalog: Vec<String>,
    /// Install `<package>-menu=<version>` with shortcuts next to each verified environment.
    pub shortcuts: bool,
    /// Two-phase update: install without shortcuts now, activate on the next update.
    pub delayed: bool,
}

/// Runs update and maintenance operations for packages installed under one base prefix.
///
/// Every operation is a synchronous call returning a structured result. Mutating
/// operations run under the package's [`ProcessLock`].
pub struct Manager<B, S> {
    pub(crate) layout: PrefixLayout,
    pub(crate) backend: B,
    pub(crate) source: S,
    pub(crate) options: ManagerOptions,
    pub(crate) phases: Vec<UpdatePhase>,
}

impl<B: PackageBackend, S: VersionSource> Manager<B, S> {
    pub fn new(layout: PrefixLayout, backend: B, source: S, mut options: ManagerOptions) -> Self {
        options.plugin_catalog = normalize_plugin_names(&options.plugin_catalog);
        Self {
            layout,
            backend,
            source,
            options,
            phases: Vec::new(),
        }
    }

    pub fn layout(&self) -> &PrefixLayout {
        &self.layout
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// The `--current-version` override, then the spec's version, then the highest
    /// verified install. Empty when none is known.
    pub fn current_version(&self, spec: &VersionSpec) -> Result<String> {
        if let Some(version) = self
            .options
            .current_version
            .as_deref()
            .filter(|v| !v.is_empty())
        {
            return Ok(version.to_string());
        }
        if !spec.version.is_empty() {
            return Ok(spec.version.clone());
        }

        let mut installed = installed_versions(&self.layout, &spec.package_name)?;
        Ok(installed.pop().unwrap_or_default())
    }

    pub(crate) fn resolve(
        &self,
        spec: &VersionSpec,
        current_version: &str,
    ) -> Result<Resolution, ResolveError> {
        resolve(
            &self.source,
            &ResolveRequest {
                package_name: &spec.package_name,
                channels: &self.options.channels,
                current_version,
                include_dev: self.options.include_dev,
            },
        )
    }

    pub(crate) fn is_plugin(&self, package_name: &str, spec: &VersionSpec) -> bool {
        let name = normalized_name(package_name);
        name != spec.package_name && self.options.plugin_catalog.binary_search(&name).is_ok()
    }

    /// Runs one backend job to completion. A job without an exit code counts as failed.
    pub(crate) fn run_job(
        &mut self,
        job: impl FnOnce(&mut B) -> Result<JobId, InstallerError>,
    ) -> Result<i32> {
        let id = job(&mut self.backend)?;
        Ok(self.backend.exit_code(id).unwrap_or(-1))
    }

    /// Installs the version's menu package. `None` when shortcuts are disabled.
    pub(crate) fn create_shortcuts(&mut self, package_name: &str, version: &str) -> Option<i32> {
        if !self.options.shortcuts {
            return None;
        }
        let prefix = self.layout.prefix_for(package_name, version);
        let menu = [menu_spec(package_name, version)];
        let code = self
            .run_job(|backend| backend.install_shortcuts(&menu, &prefix))
            .unwrap_or_else(|err| {
                warn!(
                    package = package_name,
                    version,
                    error = %format!("{err:#}"),
                    "failed to launch shortcut install"
                );
                -1
            });
        if code != 0 {
            warn!(
                package = package_name,
                version,
                exit_code = code,
                "shortcuts were not created"
            );
        }
        Some(code)
    }

    /// Uninstalls the version's menu package. `None` when shortcuts are disabled or the
    /// environment is gone.
    pub(crate) fn remove_shortcuts(&mut self, package_name: &str, version: &str) -> Option<i32> {
        let prefix = self.layout.prefix_for(package_name, version);
        if !self.options.shortcuts || !prefix.is_dir() {
            return None;
        }
        let menu = [menu_spec(package_name, version)];
        let code = self
            .run_job(|backend| backend.uninstall(&menu, &prefix))
            .unwrap_or_else(|err| {
                warn!(
                    package = package_name,
                    version,
                    error = %format!("{err:#}"),
                    "failed to launch shortcut removal"
                );
                -1
            });
        if code != 0 {
            warn!(
                package = package_name,
                version,
                exit_code = code,
                "shortcuts were not removed"
            );
        }
        Some(code)
    }

    /// Runs `operation` holding the package lock.
    ///
    /// A live holder yields `AlreadyRunning` without calling `operation`. A corrupted lock
    /// artifact is cleared and the lock retried once; if that fails too, `operation` runs
    /// unprotected.
    pub(crate) fn run_locked<T>(
        &mut self,
        package_name: &str,
        operation: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Locked<T>> {
        let mut lock = ProcessLock::new(self.layout.lock_path(package_name), package_name);

        let mutual_exclusion = match lock.lock() {
            Ok(true) => Exclusion::Held,
            Ok(false) => return Ok(already_running(&lock, package_name)),
            Err(err @ LockError::Corrupted { .. }) => {
                warn!(package = package_name, error = %err, "clearing corrupted lock artifact");
                match lock.force_clear().and_then(|_| lock.lock()) {
                    Ok(true) => Exclusion::Held,
                    Ok(false) => return Ok(already_running(&lock, package_name)),
                    Err(err) => {
                        warn!(
                            package = package_name,
                            error = %err,
                            "mutual exclusion could not be established; continuing unprotected"
                        );
                        Exclusion::Unprotected
                    }
                }
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to acquire updater lock for '{package_name}'")
                })
            }
        };
        debug!(package = package_name, exclusion = ?mutual_exclusion, "running locked operation");

        let value = operation(self);

        if let Err(err) = lock.unlock() {
            warn!(package = package_name, error = %err, "failed to release updater lock");
        }
        Ok(Locked::Ran {
            value: value?,
            mutual_exclusion,
        })
    }
}

/// The package carrying an application's menu entries.
pub(crate) fn menu_spec(package_name: &str, version: &str) -> String {
    format!("{package_name}-menu={version}")
}

fn already_running<T>(lock: &ProcessLock, package_name: &str) -> Locked<T> {
    let holder = lock.holder().ok().flatten();
    info!(
        package = package_name,
        pid = holder.as_ref().map(|holder| holder.pid),
        "another updater is running"
    );
    Locked::AlreadyRunning { holder }
}

use anyhow::{anyhow, Context, Result};
use bundlekeep_core::VersionSpec;
use bundlekeep_installer::{installed_versions, LockError, PackageBackend, ProcessLock};
use bundlekeep_resolver::VersionSource;

use crate::manager::Manager;
use crate::outcome::{PackagesReport, StatusReport, UpdateCheck, VersionReport};

impl<B: PackageBackend, S: VersionSource> Manager<B, S> {
    /// Read-only: never takes the lock. An unreachable catalog is an error, not "no updates".
    pub fn check_updates(&self, spec: &VersionSpec) -> Result<UpdateCheck> {
        let current = self.current_version(spec)?;
        let resolution = self.resolve(spec, &current)?;
        let found_versions = installed_versions(&self.layout, &spec.package_name)?;
        let installed = !resolution.latest_version.is_empty()
            && found_versions.contains(&resolution.latest_version);

        Ok(UpdateCheck {
            available_versions: resolution.available_versions,
            current_version: resolution.current_version,
            latest_version: resolution.latest_version,
            previous_version: resolution.previous_version,
            found_versions,
            update: resolution.update,
            installed,
            status: self.status(spec),
        })
    }

    pub fn check_version(&self, spec: &VersionSpec) -> Result<VersionReport> {
        Ok(VersionReport {
            version: self.current_version(spec)?,
        })
    }

    /// Packages of the current environment, plugins marked against the catalog.
    pub fn check_packages(&mut self, spec: &VersionSpec) -> Result<PackagesReport> {
        let version = self.current_version(spec)?;
        if version.is_empty() {
            return Err(anyhow!(
                "no version of '{}' given or installed",
                spec.package_name
            ));
        }

        let prefix = self.layout.prefix_for(&spec.package_name, &version);
        let mut packages = self
            .backend
            .list(&prefix)
            .with_context(|| format!("failed to list packages in {}", prefix.display()))?;
        for package in &mut packages {
            package.is_plugin = self.is_plugin(&package.name, spec);
        }
        Ok(PackagesReport { packages })
    }

    /// Whether a live updater holds the package lock. Never acquires it.
    pub fn status(&self, spec: &VersionSpec) -> StatusReport {
        let lock = ProcessLock::new(
            self.layout.lock_path(&spec.package_name),
            &spec.package_name,
        );
        match lock.live_holder() {
            Ok(holder) => StatusReport {
                busy: holder.is_some(),
                holder,
                corrupted: false,
            },
            Err(LockError::Corrupted { .. }) => StatusReport {
                busy: false,
                holder: None,
                corrupted: true,
            },
            Err(err) => {
                tracing::warn!(package = %spec.package_name, error = %err, "failed to read updater lock");
                StatusReport {
                    busy: false,
                    holder: None,
                    corrupted: false,
                }
            }
        }
    }
}

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use bundlekeep_core::VersionSpec;
use bundlekeep_installer::{
    clear_deferred, current_unix_timestamp, delete_environment, list_broken, load_deferred,
    quarantine, read_sentinel, reinstate, remove_sentinel, save_deferred, write_sentinel,
    DeferredDeletions, LifecycleError, PackageBackend, ProcessLock, Sentinel,
};
use bundlekeep_resolver::VersionSource;
use tracing::{info, warn};

use crate::manager::Manager;
use crate::outcome::{
    CleanReport, LaunchCleanReport, LockClearReport, Locked, RemoveReport, ResetReport,
    RestoreReport,
};

impl<B: PackageBackend, S: VersionSource> Manager<B, S> {
    /// Recreates the current version's environment from its pinned spec.
    pub fn restore(&mut self, spec: &VersionSpec) -> Result<Locked<RestoreReport>> {
        self.run_locked(&spec.package_name, |manager| manager.restore_locked(spec))
    }

    /// Removes unverified and quarantined environments of a package.
    pub fn clean(&mut self, spec: &VersionSpec) -> Result<Locked<CleanReport>> {
        self.run_locked(&spec.package_name, |manager| {
            manager.clean_locked(&spec.package_name)
        })
    }

    /// Once the latest version is installed, retires every other version and cleans.
    pub fn check_updates_and_clean(
        &mut self,
        spec: &VersionSpec,
    ) -> Result<Locked<LaunchCleanReport>> {
        self.run_locked(&spec.package_name, |manager| {
            let check = manager.check_updates(spec)?;
            if !check.installed {
                return Ok(LaunchCleanReport {
                    check,
                    removed_sentinels: Vec::new(),
                    clean: None,
                });
            }

            let mut removed_sentinels = Vec::new();
            for version in &check.found_versions {
                if *version == check.latest_version {
                    continue;
                }
                manager.remove_shortcuts(&spec.package_name, version);
                if remove_sentinel(&manager.layout, &spec.package_name, version)? {
                    removed_sentinels.push(version.clone());
                }
            }
            let clean = manager.clean_locked(&spec.package_name)?;
            Ok(LaunchCleanReport {
                check,
                removed_sentinels,
                clean: Some(clean),
            })
        })
    }

    /// Removes one version through the backend, deleting the prefix directly if that fails.
    /// Its shortcuts are uninstalled first.
    pub fn remove(&mut self, spec: &VersionSpec) -> Result<Locked<RemoveReport>> {
        self.run_locked(&spec.package_name, |manager| manager.remove_locked(spec))
    }

    /// Clean, then restore the current version.
    pub fn reset(&mut self, spec: &VersionSpec) -> Result<Locked<ResetReport>> {
        self.run_locked(&spec.package_name, |manager| {
            let clean = manager.clean_locked(&spec.package_name)?;
            let restore = manager.restore_locked(spec)?;
            Ok(ResetReport { clean, restore })
        })
    }

    /// Removes the lock artifact regardless of holder.
    pub fn clean_lock(&self, spec: &VersionSpec) -> Result<LockClearReport> {
        let lock = ProcessLock::new(
            self.layout.lock_path(&spec.package_name),
            &spec.package_name,
        );
        let cleared = lock.force_clear()?;
        if cleared {
            warn!(package = %spec.package_name, path = %lock.path().display(), "cleared updater lock");
        }
        Ok(LockClearReport { cleared })
    }

    /// Recreates the environment with the plugins of the last snapshot taken while this
    /// version was current, else those recorded in its sentinel. The sentinel is only
    /// touched once the outcome is known.
    fn restore_locked(&mut self, spec: &VersionSpec) -> Result<RestoreReport> {
        let version = self.required_version(spec)?;
        let package_name = spec.package_name.as_str();
        let prefix = self.layout.prefix_for(package_name, &version);
        let plugins = match self.saved_plugin_specs(package_name, &version) {
            Some(plugins) => plugins,
            None => read_sentinel(&self.layout, package_name, &version)?
                .map(|sentinel| sentinel.plugins)
                .unwrap_or_default(),
        };
        let mut failures = Vec::new();

        let quarantined = if prefix.exists() {
            match quarantine(&prefix) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(prefix = %prefix.display(), error = %err, "quarantine failed; recreating in place");
                    failures.push(err.to_string());
                    None
                }
            }
        } else {
            None
        };

        let mut specs = vec![spec.with_version(&version).pinned()];
        specs.extend(plugins.iter().cloned());
        let exit_code = self.run_job(|backend| backend.create(&specs, &prefix))?;

        let mut report = RestoreReport {
            version: version.clone(),
            exit_code,
            quarantined: quarantined.clone(),
            quarantine_kept: quarantined.is_some(),
            reinstated: false,
            shortcuts: None,
            failures: Vec::new(),
        };

        if exit_code == 0 {
            write_sentinel(
                &self.layout,
                &Sentinel {
                    package_name: package_name.to_string(),
                    version: version.clone(),
                    build_string: spec.build_string.clone(),
                    plugins,
                    created_at_unix: current_unix_timestamp(),
                },
            )?;
            if let Some(path) = &quarantined {
                match delete_environment(path) {
                    Ok(()) => report.quarantine_kept = false,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to delete quarantined environment");
                        failures.push(err.to_string());
                    }
                }
            }
            report.shortcuts = self.create_shortcuts(package_name, &version);
            info!(package = package_name, version = %version, "restored environment");
        } else if let Some(path) = &quarantined {
            // Put the previous environment back under its verified name; the failed
            // attempt is quarantined for the next clean.
            match reinstate(path, &prefix) {
                Ok(displaced) => {
                    report.reinstated = true;
                    warn!(
                        package = package_name,
                        version = %version,
                        exit_code,
                        failed_attempt = ?displaced,
                        "restore failed; previous environment reinstated"
                    );
                }
                Err(err) => {
                    warn!(
                        package = package_name,
                        version = %version,
                        exit_code,
                        error = %err,
                        "restore failed and the previous environment could not be reinstated"
                    );
                    failures.push(err.to_string());
                    remove_sentinel(&self.layout, package_name, &version)?;
                }
            }
        } else {
            warn!(
                package = package_name,
                version = %version,
                exit_code,
                "restore failed; environment left in place"
            );
        }

        report.failures = failures;
        Ok(report)
    }

    /// Paths deferred by the previous pass are deleted directly; broken environments go
    /// through the backend and are deferred when it fails.
    fn clean_locked(&mut self, package_name: &str) -> Result<CleanReport> {
        let mut report = CleanReport::default();
        let mut still_deferred: Vec<PathBuf> = Vec::new();

        for path in load_deferred(&self.layout, package_name)?.paths {
            match delete_environment(&path) {
                Ok(()) => report.deleted.push(path),
                Err(LifecycleError::NotFound(_)) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "deferred delete failed");
                    report.failures.push(err.to_string());
                    still_deferred.push(path);
                }
            }
        }

        for prefix in list_broken(&self.layout, package_name)? {
            if still_deferred.contains(&prefix) {
                continue;
            }
            let exit_code = match self.run_job(|backend| backend.remove(&prefix)) {
                Ok(code) => code,
                Err(err) => {
                    report.failures.push(format!("{err:#}"));
                    -1
                }
            };
            if exit_code != 0 {
                info!(prefix = %prefix.display(), exit_code, "backend could not remove; deferring");
                report.deferred.push(prefix);
                continue;
            }

            // The backend can leave an emptied prefix behind.
            if prefix.exists() {
                if let Err(err) = delete_environment(&prefix) {
                    report.failures.push(err.to_string());
                }
            }
            report.removed.push(prefix);
        }

        still_deferred.extend(report.deferred.iter().cloned());
        if still_deferred.is_empty() {
            clear_deferred(&self.layout, package_name)?;
        } else {
            save_deferred(
                &self.layout,
                &DeferredDeletions {
                    package_name: package_name.to_string(),
                    paths: still_deferred,
                },
            )?;
        }
        Ok(report)
    }

    fn remove_locked(&mut self, spec: &VersionSpec) -> Result<RemoveReport> {
        let version = self.required_version(spec)?;
        let prefix = self.layout.prefix_for(&spec.package_name, &version);
        let mut report = RemoveReport {
            version: version.clone(),
            backend_exit_code: None,
            quarantined: None,
            deleted_directly: false,
            shortcuts: None,
            failures: Vec::new(),
        };

        remove_sentinel(&self.layout, &spec.package_name, &version)?;
        if !prefix.exists() {
            report
                .failures
                .push(LifecycleError::NotFound(prefix).to_string());
            return Ok(report);
        }

        report.shortcuts = self.remove_shortcuts(&spec.package_name, &version);
        report.backend_exit_code = match self.run_job(|backend| backend.remove(&prefix)) {
            Ok(code) => Some(code),
            Err(err) => {
                report.failures.push(format!("{err:#}"));
                None
            }
        };

        if report.backend_exit_code != Some(0) || prefix.exists() {
            // Deleted only once off the environment's own name.
            match quarantine(&prefix) {
                Ok(path) => {
                    match delete_environment(&path) {
                        Ok(()) => report.deleted_directly = true,
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "direct delete failed");
                            report.failures.push(err.to_string());
                        }
                    }
                    report.quarantined = Some(path);
                }
                Err(LifecycleError::NotFound(_)) => {}
                Err(err) => {
                    warn!(prefix = %prefix.display(), error = %err, "could not quarantine before delete");
                    report.failures.push(err.to_string());
                }
            }
        }

        Ok(report)
    }

    fn required_version(&self, spec: &VersionSpec) -> Result<String> {
        let version = self.current_version(spec)?;
        if version.is_empty() {
            return Err(anyhow!(
                "no version of '{}' given or installed",
                spec.package_name
            ));
        }
        Ok(version)
    }
}

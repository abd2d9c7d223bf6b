use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bundlekeep_core::{InstalledPackage, PackageSource, VersionSpec};
use bundlekeep_installer::{
    current_unix_timestamp, has_sentinel, installed_versions, load_snapshot, quarantine,
    remove_sentinel, save_snapshot, write_sentinel, PackageBackend, Sentinel, UpdateSnapshot,
};
use bundlekeep_resolver::VersionSource;
use tracing::{debug, info, warn};

use crate::manager::Manager;
use crate::outcome::{InstallStrategy, Locked, PluginStatus, UpdateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    LockAcquired,
    Resolving,
    Snapshotting,
    InstallingAtomic,
    InstallingSequential,
    Finalizing,
    Done,
    Failed,
}

impl<B: PackageBackend, S: VersionSource> Manager<B, S> {
    /// Phases entered by the most recent `update` or `revert`.
    pub fn phases(&self) -> &[UpdatePhase] {
        &self.phases
    }

    /// Installs the latest available version into a fresh environment. With delayed
    /// updates the install skips shortcuts, and a later call activates it.
    pub fn update(&mut self, spec: &VersionSpec) -> Result<Locked<UpdateOutcome>> {
        self.start_run(spec);
        let result = self.run_locked(&spec.package_name, |manager| {
            manager.enter(spec, UpdatePhase::LockAcquired);
            manager.update_locked(spec)
        });
        self.finish_run(spec, &result);
        result
    }

    /// Installs the version preceding the current one and retires the current sentinel.
    pub fn revert(&mut self, spec: &VersionSpec) -> Result<Locked<UpdateOutcome>> {
        self.start_run(spec);
        let result = self.run_locked(&spec.package_name, |manager| {
            manager.enter(spec, UpdatePhase::LockAcquired);
            manager.revert_locked(spec)
        });
        self.finish_run(spec, &result);
        result
    }

    fn update_locked(&mut self, spec: &VersionSpec) -> Result<UpdateOutcome> {
        self.enter(spec, UpdatePhase::Resolving);
        let current = self.current_version(spec)?;
        let resolution = match self.resolve(spec, &current) {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(package = %spec.package_name, error = %err, "version resolution failed");
                self.enter(spec, UpdatePhase::Failed);
                return Ok(UpdateOutcome::CatalogUnavailable {
                    detail: err.to_string(),
                });
            }
        };

        let latest = resolution.latest_version;
        if latest.is_empty() {
            info!(package = %spec.package_name, "no versions available");
            return Ok(UpdateOutcome::NothingAvailable);
        }
        if self.options.delayed && self.is_verified(spec, &latest) {
            if let Some(outcome) = self.activate(spec, &latest)? {
                return Ok(outcome);
            }
        }
        if !resolution.update || self.is_verified(spec, &latest) {
            info!(package = %spec.package_name, version = %latest, "already up to date");
            return Ok(UpdateOutcome::UpToDate { version: latest });
        }

        self.enter(spec, UpdatePhase::Snapshotting);
        let plugins = self.snapshot(spec, &current, &latest)?;
        let with_shortcuts = !self.options.delayed;
        self.install_version(spec, &latest, &plugins, with_shortcuts)
    }

    /// Moves shortcuts to `latest` and retires every other verified version. `None`
    /// when there is nothing left to hand over.
    fn activate(&mut self, spec: &VersionSpec, latest: &str) -> Result<Option<UpdateOutcome>> {
        let package_name = spec.package_name.as_str();
        let retiring: Vec<String> = installed_versions(&self.layout, package_name)?
            .into_iter()
            .filter(|version| version != latest)
            .collect();
        if retiring.is_empty() {
            return Ok(None);
        }

        self.enter(spec, UpdatePhase::Finalizing);
        let shortcuts = self.create_shortcuts(package_name, latest);
        for version in &retiring {
            self.remove_shortcuts(package_name, version);
            remove_sentinel(&self.layout, package_name, version)?;
        }
        info!(
            package = package_name,
            version = latest,
            retired = ?retiring,
            "activated delayed update"
        );
        Ok(Some(UpdateOutcome::Activated {
            version: latest.to_string(),
            retired: retiring,
            shortcuts,
        }))
    }

    fn revert_locked(&mut self, spec: &VersionSpec) -> Result<UpdateOutcome> {
        self.enter(spec, UpdatePhase::Resolving);
        let current = self.current_version(spec)?;
        if current.is_empty() {
            return Err(anyhow!(
                "no installed version of '{}' to revert from",
                spec.package_name
            ));
        }
        let resolution = match self.resolve(spec, &current) {
            Ok(resolution) => resolution,
            Err(err) => {
                self.enter(spec, UpdatePhase::Failed);
                return Ok(UpdateOutcome::CatalogUnavailable {
                    detail: err.to_string(),
                });
            }
        };

        let previous = resolution.previous_version;
        if previous.is_empty() {
            info!(package = %spec.package_name, version = %current, "no earlier version to revert to");
            return Ok(UpdateOutcome::NothingAvailable);
        }

        let outcome = if self.is_verified(spec, &previous) {
            UpdateOutcome::UpToDate { version: previous }
        } else {
            // Read before the snapshot below replaces it.
            let saved = self.saved_plugin_specs(&spec.package_name, &previous);
            self.enter(spec, UpdatePhase::Snapshotting);
            let listed = self.snapshot(spec, &current, &previous)?;
            let plugins = saved.unwrap_or(listed);
            self.install_version(spec, &previous, &plugins, true)?
        };

        if outcome.is_success() {
            self.remove_shortcuts(&spec.package_name, &current);
            remove_sentinel(&self.layout, &spec.package_name, &current)?;
            info!(package = %spec.package_name, version = %current, "retired reverted version");
        }
        Ok(outcome)
    }

    /// Records what the current environment holds before anything is mutated.
    /// Returns the installed plugin names to carry into the new environment.
    fn snapshot(
        &mut self,
        spec: &VersionSpec,
        current: &str,
        target: &str,
    ) -> Result<Vec<String>> {
        let prefix = self.layout.prefix_for(&spec.package_name, current);
        let listed = if !current.is_empty() && prefix.is_dir() {
            self.backend
                .list(&prefix)
                .with_context(|| format!("failed to list packages in {}", prefix.display()))?
        } else {
            debug!(prefix = %prefix.display(), "no current environment to snapshot");
            Vec::new()
        };

        let packages: Vec<InstalledPackage> = listed
            .into_iter()
            .map(|mut package| {
                package.is_plugin = self.is_plugin(&package.name, spec);
                package
            })
            .collect();
        let plugins: Vec<String> = packages
            .iter()
            .filter(|package| package.is_plugin)
            .map(|package| package.name.clone())
            .collect();

        let path = save_snapshot(
            &self.layout,
            &UpdateSnapshot {
                application: spec.package_name.clone(),
                current_version: current.to_string(),
                target_version: target.to_string(),
                packages,
                channels: self.options.channels.clone(),
                dev: self.options.include_dev,
                plugins: plugins.clone(),
                saved_at_unix: current_unix_timestamp(),
            },
        )?;
        info!(path = %path.display(), plugins = plugins.len(), "saved update snapshot");
        Ok(plugins)
    }

    /// Plugin specs recorded by the last snapshot taken while `version` was current,
    /// conda plugins pinned to the recorded version. `None` without such a snapshot.
    pub(crate) fn saved_plugin_specs(
        &self,
        package_name: &str,
        version: &str,
    ) -> Option<Vec<String>> {
        let snapshot = match load_snapshot(&self.layout, package_name) {
            Ok(Some(snapshot)) if snapshot.current_version == version => snapshot,
            Ok(_) => return None,
            Err(err) => {
                warn!(
                    package = package_name,
                    error = %format!("{err:#}"),
                    "ignoring unreadable snapshot"
                );
                return None;
            }
        };
        Some(
            snapshot
                .packages
                .iter()
                .filter(|package| package.is_plugin)
                .map(|package| match package.source {
                    PackageSource::Conda => format!("{}={}", package.name, package.version),
                    PackageSource::Pip => package.name.clone(),
                })
                .collect(),
        )
    }

    /// Atomic create first; on failure the pinned package alone, then each plugin.
    /// Only the pinned package's exit code decides whether the sentinel is written.
    fn install_version(
        &mut self,
        spec: &VersionSpec,
        version: &str,
        plugins: &[String],
        with_shortcuts: bool,
    ) -> Result<UpdateOutcome> {
        let target = self.layout.prefix_for(&spec.package_name, version);
        let pinned = spec.with_version(version).pinned();

        self.set_aside_unverified(spec, version, &target)?;
        self.enter(spec, UpdatePhase::InstallingAtomic);
        let mut specs = Vec::with_capacity(plugins.len() + 1);
        specs.push(pinned.clone());
        specs.extend(plugins.iter().cloned());
        let atomic_code = self.run_job(|backend| backend.create(&specs, &target))?;

        let (strategy, pinned_code, statuses) = if atomic_code == 0 {
            let statuses = plugins
                .iter()
                .map(|name| PluginStatus {
                    name: name.clone(),
                    exit_code: Some(0),
                    installed: true,
                })
                .collect();
            (InstallStrategy::Atomic, 0, statuses)
        } else {
            info!(
                package = %spec.package_name,
                version,
                exit_code = atomic_code,
                "batched install failed; installing packages one at a time"
            );
            self.enter(spec, UpdatePhase::InstallingSequential);
            self.set_aside_unverified(spec, version, &target)?;

            let pinned_code =
                self.run_job(|backend| backend.create(std::slice::from_ref(&pinned), &target))?;
            let mut statuses = Vec::with_capacity(plugins.len());
            for plugin in plugins {
                if pinned_code != 0 {
                    statuses.push(PluginStatus {
                        name: plugin.clone(),
                        exit_code: None,
                        installed: false,
                    });
                    continue;
                }
                let code = self
                    .run_job(|backend| backend.install(std::slice::from_ref(plugin), &target))?;
                if code != 0 {
                    warn!(plugin = %plugin, exit_code = code, "plugin failed to install");
                }
                statuses.push(PluginStatus {
                    name: plugin.clone(),
                    exit_code: Some(code),
                    installed: code == 0,
                });
            }
            (InstallStrategy::Sequential, pinned_code, statuses)
        };

        self.enter(spec, UpdatePhase::Finalizing);
        if pinned_code != 0 {
            warn!(
                package = %spec.package_name,
                version,
                exit_code = pinned_code,
                "install failed; environment left unverified"
            );
            return Ok(UpdateOutcome::PartialFailure {
                version: version.to_string(),
                detail: format!("{pinned} failed with exit code {pinned_code}"),
                plugins: statuses,
            });
        }

        write_sentinel(
            &self.layout,
            &Sentinel {
                package_name: spec.package_name.clone(),
                version: version.to_string(),
                build_string: spec.build_string.clone(),
                plugins: statuses
                    .iter()
                    .filter(|status| status.installed)
                    .map(|status| status.name.clone())
                    .collect(),
                created_at_unix: current_unix_timestamp(),
            },
        )?;
        info!(package = %spec.package_name, version, ?strategy, "install verified");
        let shortcuts = if with_shortcuts {
            self.create_shortcuts(&spec.package_name, version)
        } else {
            None
        };
        Ok(UpdateOutcome::Success {
            version: version.to_string(),
            strategy,
            plugins: statuses,
            shortcuts,
        })
    }

    /// Moves a leftover environment without a sentinel out of the way of a fresh create.
    fn set_aside_unverified(
        &self,
        spec: &VersionSpec,
        version: &str,
        target: &Path,
    ) -> Result<()> {
        if target.exists() && !has_sentinel(&self.layout, &spec.package_name, version) {
            quarantine(target)?;
        }
        Ok(())
    }

    fn is_verified(&self, spec: &VersionSpec, version: &str) -> bool {
        has_sentinel(&self.layout, &spec.package_name, version)
            && self.layout.prefix_for(&spec.package_name, version).is_dir()
    }

    fn start_run(&mut self, spec: &VersionSpec) {
        self.phases.clear();
        self.enter(spec, UpdatePhase::Idle);
    }

    fn finish_run(&mut self, spec: &VersionSpec, result: &Result<Locked<UpdateOutcome>>) {
        match result {
            Ok(Locked::Ran { .. }) if self.phases.last() != Some(&UpdatePhase::Failed) => {
                self.enter(spec, UpdatePhase::Done)
            }
            Ok(_) => {}
            Err(_) => self.enter(spec, UpdatePhase::Failed),
        }
    }

    fn enter(&mut self, spec: &VersionSpec, phase: UpdatePhase) {
        debug!(
            package = %spec.package_name,
            from = ?self.phases.last(),
            to = ?phase,
            "update phase"
        );
        self.phases.push(phase);
    }
}

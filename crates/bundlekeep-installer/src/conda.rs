use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use bundlekeep_core::{InstalledPackage, PackageSource};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::{InstallerError, JobId, JobKind, JobRegistry, PackageBackend};

const PINNED_PACKAGES_ENV: &str = "CONDA_PINNED_PACKAGES";

/// `PackageBackend` driving a conda-compatible executable (`conda`, `mamba`, `micromamba`).
#[derive(Debug)]
pub struct CondaBackend {
    program: PathBuf,
    channels: Vec<String>,
    /// First spec of the last create into each prefix.
    pinned: HashMap<PathBuf, String>,
    jobs: JobRegistry,
}

impl CondaBackend {
    pub fn new(program: impl Into<PathBuf>, channels: Vec<String>) -> Self {
        Self {
            program: program.into(),
            channels,
            pinned: HashMap::new(),
            jobs: JobRegistry::default(),
        }
    }

    /// Spec pinned for later installs into `prefix`. Only mamba honours it.
    pub fn pinned_for(&self, prefix: &Path) -> Option<&str> {
        self.pinned.get(prefix).map(String::as_str)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Finds the backend executable. `preferred` names a program (or path) to look for first;
    /// otherwise mamba wins over conda. Falls back to a bare `conda` resolved by the OS.
    pub fn detect_program(base_prefix: &Path, preferred: Option<&str>) -> PathBuf {
        let mut names: Vec<&str> = Vec::new();
        if let Some(preferred) = preferred {
            let candidate = Path::new(preferred);
            if candidate.components().count() > 1 {
                return candidate.to_path_buf();
            }
            names.push(preferred);
        }
        names.extend(["mamba", "conda"]);

        let mut dirs = vec![
            base_prefix.join("condabin"),
            base_prefix.join("bin"),
            base_prefix.join("Scripts"),
        ];
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }

        for name in &names {
            for dir in &dirs {
                for file_name in executable_names(name) {
                    let candidate = dir.join(file_name);
                    if candidate.is_file() {
                        return candidate;
                    }
                }
            }
        }

        PathBuf::from(preferred.unwrap_or("conda"))
    }

    fn uses_pinned_env(&self) -> bool {
        self.program
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem == "mamba")
    }

    fn command(&self, prefix: &Path, args: Vec<OsString>) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(pinned) = self.pinned_for(prefix).filter(|_| self.uses_pinned_env()) {
            let value = match std::env::var(PINNED_PACKAGES_ENV) {
                Ok(existing) if !existing.is_empty() => format!("{pinned}&{existing}"),
                _ => pinned.to_string(),
            };
            command.env(PINNED_PACKAGES_ENV, value);
        }
        command
    }

    fn run(
        &mut self,
        kind: JobKind,
        prefix: &Path,
        specs: &[String],
    ) -> Result<(JobId, Vec<u8>), InstallerError> {
        let args = backend_args(kind, prefix, &self.channels, specs);
        debug!(
            program = %self.program.display(),
            job = kind.as_str(),
            prefix = %prefix.display(),
            "running package backend"
        );

        let output = self
            .command(prefix, args)
            .output()
            .map_err(|source| InstallerError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        // Killed by a signal: no exit code.
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                job = kind.as_str(),
                prefix = %prefix.display(),
                exit_code,
                stderr = stderr.trim(),
                "package backend job failed"
            );
        }

        let id = self.jobs.record(kind, prefix, specs, exit_code);
        Ok((id, output.stdout))
    }
}

impl PackageBackend for CondaBackend {
    fn create(&mut self, specs: &[String], prefix: &Path) -> Result<JobId, InstallerError> {
        if let Some(first) = specs.first() {
            self.pinned.insert(prefix.to_path_buf(), first.clone());
        }
        self.run(JobKind::Create, prefix, specs).map(|(id, _)| id)
    }

    fn install(&mut self, specs: &[String], prefix: &Path) -> Result<JobId, InstallerError> {
        self.run(JobKind::Install, prefix, specs).map(|(id, _)| id)
    }

    fn install_shortcuts(
        &mut self,
        specs: &[String],
        prefix: &Path,
    ) -> Result<JobId, InstallerError> {
        self.run(JobKind::InstallShortcuts, prefix, specs)
            .map(|(id, _)| id)
    }

    fn uninstall(&mut self, packages: &[String], prefix: &Path) -> Result<JobId, InstallerError> {
        self.run(JobKind::Uninstall, prefix, packages)
            .map(|(id, _)| id)
    }

    fn remove(&mut self, prefix: &Path) -> Result<JobId, InstallerError> {
        self.run(JobKind::Remove, prefix, &[]).map(|(id, _)| id)
    }

    fn list(&mut self, prefix: &Path) -> Result<Vec<InstalledPackage>, InstallerError> {
        let (id, stdout) = self.run(JobKind::List, prefix, &[])?;
        let exit_code = self.jobs.exit_code(id).unwrap_or(-1);
        if exit_code != 0 {
            return Err(InstallerError::ListFailed {
                prefix: prefix.to_path_buf(),
                exit_code,
            });
        }

        let stdout = String::from_utf8_lossy(&stdout);
        parse_list_output(&stdout).map_err(|reason| InstallerError::ListDecode {
            prefix: prefix.to_path_buf(),
            reason,
        })
    }

    fn exit_code(&self, job: JobId) -> Option<i32> {
        self.jobs.exit_code(job)
    }
}

/// Command-line arguments for one backend job.
pub fn backend_args(
    kind: JobKind,
    prefix: &Path,
    channels: &[String],
    specs: &[String],
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    match kind {
        JobKind::Create | JobKind::Install | JobKind::InstallShortcuts => {
            let verb = if kind == JobKind::Create {
                "create"
            } else {
                "install"
            };
            args.extend([verb, "-y"].map(OsString::from));
            if kind == JobKind::InstallShortcuts {
                args.push("--shortcuts".into());
            }
            args.push("--prefix".into());
            args.push(prefix.into());
            for channel in channels {
                args.push("-c".into());
                args.push(channel.into());
            }
            args.extend(specs.iter().map(OsString::from));
        }
        JobKind::Uninstall => {
            args.extend(["remove", "-y", "--prefix"].map(OsString::from));
            args.push(prefix.into());
            args.extend(specs.iter().map(OsString::from));
        }
        JobKind::Remove => {
            args.extend(["remove", "-y", "--all", "--prefix"].map(OsString::from));
            args.push(prefix.into());
        }
        JobKind::List => {
            args.extend(["list", "--prefix"].map(OsString::from));
            args.push(prefix.into());
            args.push("--json".into());
        }
    }
    args
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    version: String,
    #[serde(default)]
    build_string: String,
    #[serde(default)]
    platform: String,
}

/// Parses `list --json` output; entries whose platform is `pypi` came from pip.
pub fn parse_list_output(stdout: &str) -> Result<Vec<InstalledPackage>, String> {
    let entries: Vec<ListEntry> =
        serde_json::from_str(stdout.trim()).map_err(|err| err.to_string())?;
    Ok(entries
        .into_iter()
        .map(|entry| InstalledPackage {
            name: entry.name,
            version: entry.version,
            build_string: entry.build_string,
            source: PackageSource::from_platform(&entry.platform),
            is_plugin: false,
        })
        .collect())
}

fn executable_names(name: &str) -> Vec<String> {
    if cfg!(windows) {
        vec![
            format!("{name}.exe"),
            format!("{name}.bat"),
            name.to_string(),
        ]
    } else {
        vec![name.to_string()]
    }
}

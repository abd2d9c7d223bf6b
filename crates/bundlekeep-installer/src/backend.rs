use std::path::{Path, PathBuf};

use bundlekeep_core::InstalledPackage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("failed to launch package backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listing packages in {} exited with code {exit_code}", prefix.display())]
    ListFailed { prefix: PathBuf, exit_code: i32 },
    #[error("failed to decode package listing for {}: {reason}", prefix.display())]
    ListDecode { prefix: PathBuf, reason: String },
}

/// Opaque handle for one backend invocation. Only used to look up its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Create,
    Install,
    /// Install with menu shortcuts enabled.
    InstallShortcuts,
    /// Remove named packages, keeping the environment.
    Uninstall,
    Remove,
    List,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Install => "install",
            Self::InstallShortcuts => "install-shortcuts",
            Self::Uninstall => "uninstall",
            Self::Remove => "remove",
            Self::List => "list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub prefix: PathBuf,
    pub specs: Vec<String>,
    pub exit_code: i32,
}

/// Bookkeeping for backend jobs issued during one manager operation.
#[derive(Debug, Default)]
pub struct JobRegistry {
    next_id: u64,
    jobs: Vec<JobRecord>,
}

impl JobRegistry {
    pub fn record(
        &mut self,
        kind: JobKind,
        prefix: &Path,
        specs: &[String],
        exit_code: i32,
    ) -> JobId {
        self.next_id += 1;
        let id = JobId(self.next_id);
        self.jobs.push(JobRecord {
            id,
            kind,
            prefix: prefix.to_path_buf(),
            specs: specs.to_vec(),
            exit_code,
        });
        id
    }

    pub fn exit_code(&self, job: JobId) -> Option<i32> {
        self.jobs
            .iter()
            .find(|record| record.id == job)
            .map(|record| record.exit_code)
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|record| record.exit_code != 0)
    }
}

/// Adapter over an external package manager. Each mutating call runs one job to completion
/// and returns its handle; `exit_code` reports the finished job's status.
pub trait PackageBackend {
    fn create(&mut self, specs: &[String], prefix: &Path) -> Result<JobId, InstallerError>;

    fn install(&mut self, specs: &[String], prefix: &Path) -> Result<JobId, InstallerError>;

    /// Installs `specs` letting the backend create their menu shortcuts.
    fn install_shortcuts(
        &mut self,
        specs: &[String],
        prefix: &Path,
    ) -> Result<JobId, InstallerError>;

    /// Removes `packages` from `prefix`; their shortcuts go with them.
    fn uninstall(&mut self, packages: &[String], prefix: &Path) -> Result<JobId, InstallerError>;

    /// Removes the whole environment.
    fn remove(&mut self, prefix: &Path) -> Result<JobId, InstallerError>;

    fn list(&mut self, prefix: &Path) -> Result<Vec<InstalledPackage>, InstallerError>;

    fn exit_code(&self, job: JobId) -> Option<i32>;
}

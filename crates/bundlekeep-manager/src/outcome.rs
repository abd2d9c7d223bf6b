use std::path::PathBuf;

use bundlekeep_core::InstalledPackage;
use bundlekeep_installer::LockHolder;
use serde::Serialize;

/// Whether a mutating operation ran under the process lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    Held,
    /// The lock could not be established; the operation ran best-effort.
    Unprotected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locked<T> {
    Ran { value: T, mutual_exclusion: Exclusion },
    AlreadyRunning { holder: Option<LockHolder> },
}

impl<T> Locked<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ran { value, .. } => Some(value),
            Self::AlreadyRunning { .. } => None,
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStrategy {
    Atomic,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub name: String,
    /// `None` when the plugin was never attempted.
    pub exit_code: Option<i32>,
    pub installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Success {
        version: String,
        strategy: InstallStrategy,
        plugins: Vec<PluginStatus>,
        /// Exit code of the shortcut install, when one ran.
        #[serde(skip_serializing_if = "Option::is_none")]
        shortcuts: Option<i32>,
    },
    /// Second phase of a delayed update: the installed latest version takes over.
    Activated {
        version: String,
        retired: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        shortcuts: Option<i32>,
    },
    UpToDate {
        version: String,
    },
    NothingAvailable,
    CatalogUnavailable {
        detail: String,
    },
    /// The pinned package failed on every strategy; no sentinel was written.
    PartialFailure {
        version: String,
        detail: String,
        plugins: Vec<PluginStatus>,
    },
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::Activated { .. } | Self::UpToDate { .. }
        )
    }

    /// Message for outcomes that leave the package without the requested version.
    pub fn failure_detail(&self) -> Option<&str> {
        match self {
            Self::CatalogUnavailable { detail } | Self::PartialFailure { detail, .. } => {
                Some(detail)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub version: String,
    pub exit_code: i32,
    /// Where the existing environment was moved before recreating.
    pub quarantined: Option<PathBuf>,
    /// The quarantined copy still exists.
    pub quarantine_kept: bool,
    /// The recreate failed and the quarantined copy was moved back into place.
    pub reinstated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortcuts: Option<i32>,
    pub failures: Vec<String>,
}

impl RestoreReport {
    pub fn failure_detail(&self) -> Option<String> {
        (self.exit_code != 0).then(|| {
            format!(
                "recreating {} failed with exit code {}",
                self.version, self.exit_code
            )
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    /// Removed through the backend.
    pub removed: Vec<PathBuf>,
    /// Left for the next clean to delete directly.
    pub deferred: Vec<PathBuf>,
    /// Deleted directly from an earlier deferred list.
    pub deleted: Vec<PathBuf>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveReport {
    pub version: String,
    pub backend_exit_code: Option<i32>,
    /// Where a leftover prefix was moved before the direct delete.
    pub quarantined: Option<PathBuf>,
    pub deleted_directly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortcuts: Option<i32>,
    pub failures: Vec<String>,
}

impl RemoveReport {
    /// Set when neither the backend nor the direct delete got rid of the environment.
    pub fn failure_detail(&self) -> Option<String> {
        if self.backend_exit_code == Some(0) || self.deleted_directly {
            return None;
        }
        Some(
            self.failures
                .first()
                .cloned()
                .unwrap_or_else(|| format!("removing {} failed", self.version)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub clean: CleanReport,
    pub restore: RestoreReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub busy: bool,
    pub holder: Option<LockHolder>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub corrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCheck {
    pub available_versions: Vec<String>,
    pub current_version: String,
    pub latest_version: String,
    pub previous_version: String,
    pub found_versions: Vec<String>,
    pub update: bool,
    pub installed: bool,
    pub status: StatusReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCleanReport {
    pub check: UpdateCheck,
    pub removed_sentinels: Vec<String>,
    pub clean: Option<CleanReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReport {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagesReport {
    pub packages: Vec<InstalledPackage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockClearReport {
    pub cleared: bool,
}

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fs_utils::current_unix_timestamp;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock artifact at {} is corrupted: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },
    #[error("failed to {action} lock {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Contents of the lock file: who holds it and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub package_name: String,
    pub acquired_at_unix: u64,
    /// Distinguishes lock instances inside one process.
    #[serde(default)]
    pub token: String,
}

/// Cross-process, non-blocking exclusion keyed by a lock file path.
///
/// The holder record is written to a private file first and published with a hard
/// link, so the lock path never exists without a complete record. A file whose owner
/// process has exited is reclaimed once. Dropping a held lock releases it.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    package_name: String,
    token: String,
    held: bool,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

impl ProcessLock {
    pub fn new(path: impl Into<PathBuf>, package_name: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self {
            path: path.into(),
            package_name: package_name.to_string(),
            token: format!(
                "{}-{nanos}-{}",
                std::process::id(),
                NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
            ),
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// `Ok(false)` means another live process, or another lock in this process, holds it.
    pub fn lock(&mut self) -> Result<bool, LockError> {
        if self.held {
            return Ok(true);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                action: "create directory for",
                path: self.path.clone(),
                source,
            })?;
        }

        for _ in 0..2 {
            if self.claim()? {
                self.held = true;
                debug!(path = %self.path.display(), "acquired process lock");
                return Ok(true);
            }

            let Some(holder) = read_holder(&self.path)? else {
                // Released between our claim and read.
                continue;
            };
            if holder.pid == std::process::id() || process_alive(holder.pid) {
                return Ok(false);
            }
            warn!(
                path = %self.path.display(),
                pid = holder.pid,
                "reclaiming lock left by exited process"
            );
            if !self.reclaim(&holder)? {
                return Ok(false);
            }
        }

        Ok(false)
    }

    /// Links a fully written holder record into place. `Ok(false)` when something
    /// already occupies the lock path.
    fn claim(&self) -> Result<bool, LockError> {
        if fs::symlink_metadata(&self.path).is_ok() {
            return Ok(false);
        }

        let holder = LockHolder {
            pid: std::process::id(),
            package_name: self.package_name.clone(),
            acquired_at_unix: current_unix_timestamp(),
            token: self.token.clone(),
        };
        let payload = serde_json::to_vec(&holder).map_err(|err| LockError::Corrupted {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;

        let staged = self.sibling("claim");
        let written = fs::File::create(&staged).and_then(|mut file| {
            file.write_all(&payload)?;
            file.sync_all()
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&staged);
            return Err(LockError::Io {
                action: "stage",
                path: staged,
                source,
            });
        }

        let linked = fs::hard_link(&staged, &self.path);
        let _ = fs::remove_file(&staged);
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LockError::Io {
                action: "claim",
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Moves a dead holder's file aside. Returns `false` when the file turned out to
    /// belong to someone else, who is then put back.
    fn reclaim(&self, dead: &LockHolder) -> Result<bool, LockError> {
        let aside = self.sibling("stale");
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(source) => {
                return Err(LockError::Io {
                    action: "reclaim",
                    path: self.path.clone(),
                    source,
                })
            }
        }

        let moved = read_holder(&aside);
        if matches!(&moved, Ok(Some(holder)) if holder == dead) {
            remove_lock_file(&aside)?;
            return Ok(true);
        }

        if let Err(err) = fs::hard_link(&aside, &self.path) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "failed to put back a lock claimed during reclaim"
            );
        }
        remove_lock_file(&aside)?;
        Ok(false)
    }

    fn sibling(&self, purpose: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{purpose}-{}", self.token));
        PathBuf::from(name)
    }

    /// Releases the lock if this instance holds it. A lock file now owned by another
    /// holder, or one that cannot be read, is left alone.
    pub fn unlock(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        match read_holder(&self.path) {
            Ok(Some(holder)) if holder.token == self.token => remove_lock_file(&self.path),
            Ok(Some(holder)) => {
                warn!(
                    path = %self.path.display(),
                    pid = holder.pid,
                    "lock was taken over by another holder; not removing"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(LockError::Corrupted { reason, .. }) => {
                warn!(
                    path = %self.path.display(),
                    reason = %reason,
                    "lock file is unreadable; leaving it for clean-lock"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Reads the current holder without trying to acquire.
    pub fn holder(&self) -> Result<Option<LockHolder>, LockError> {
        read_holder(&self.path)
    }

    /// The holder, if its process is still running.
    pub fn live_holder(&self) -> Result<Option<LockHolder>, LockError> {
        Ok(self
            .holder()?
            .filter(|holder| holder.pid == std::process::id() || process_alive(holder.pid)))
    }

    /// Removes the lock artifact whatever its kind or owner. Returns whether anything was removed.
    pub fn force_clear(&self) -> Result<bool, LockError> {
        let metadata = match fs::symlink_metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(LockError::Io {
                    action: "inspect",
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        };
        removed.map_err(|source| LockError::Io {
            action: "clear",
            path: self.path.clone(),
            source,
        })?;
        Ok(true)
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            warn!(path = %self.path.display(), error = %err, "failed to release process lock");
        }
    }
}

fn read_holder(path: &Path) -> Result<Option<LockHolder>, LockError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(LockError::Corrupted {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|err| LockError::Corrupted {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

fn remove_lock_file(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Io {
            action: "remove",
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Failed liveness checks count as alive so a live holder is never evicted.
fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        match Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(err) => {
                warn!(pid, error = %err, "failed executing owner liveness check");
                true
            }
        }
    }

    #[cfg(windows)]
    {
        match Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                stdout.contains(&format!(",\"{pid}\""))
                    && !stdout.to_ascii_lowercase().contains("no tasks are running")
            }
            Ok(_) => true,
            Err(err) => {
                warn!(pid, error = %err, "failed executing owner liveness check");
                true
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        true
    }
}

mod backend;
mod conda;
mod fs_utils;
mod layout;
mod lifecycle;
mod lock;
mod sentinels;
mod state;

pub use backend::{InstallerError, JobId, JobKind, JobRecord, JobRegistry, PackageBackend};
pub use conda::{backend_args, parse_list_output, CondaBackend};
pub use fs_utils::current_unix_timestamp;
pub use layout::{base_prefix_from_conda_prefix, default_base_prefix, PrefixLayout};
pub use lifecycle::{
    delete_environment, list_broken, list_environments, quarantine, reinstate, Environment,
    LifecycleError,
};
pub use lock::{LockError, LockHolder, ProcessLock};
pub use sentinels::{
    has_sentinel, installed_versions, read_sentinel, remove_sentinel, sentinel_versions,
    write_sentinel, Sentinel,
};
pub use state::{
    clear_deferred, load_deferred, load_snapshot, save_deferred, save_snapshot,
    DeferredDeletions, UpdateSnapshot,
};

#[cfg(test)]
mod tests;

mod config;
mod maintenance;
mod manager;
mod outcome;
mod queries;
mod update;

pub use config::ManagerConfig;
pub use manager::{Manager, ManagerOptions};
pub use outcome::{
    CleanReport, Exclusion, InstallStrategy, LaunchCleanReport, LockClearReport, Locked,
    PackagesReport, PluginStatus, RemoveReport, ResetReport, RestoreReport, StatusReport,
    UpdateCheck, UpdateOutcome, VersionReport,
};
pub use update::UpdatePhase;

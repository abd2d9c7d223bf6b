use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;

use completion::CliCompletionShell;

const LOG_ENV: &str = "BUNDLEKEEP_LOG";

#[derive(Parser, Debug)]
#[command(name = "bundlekeep", version)]
#[command(
    about = "Keeps bundled conda applications up to date in side-by-side environments",
    long_about = None
)]
struct Cli {
    /// Base prefix of the conda installation holding the environments
    #[arg(long, global = true, env = "BUNDLEKEEP_PREFIX")]
    prefix: Option<PathBuf>,
    /// Log level for diagnostics on stderr; BUNDLEKEEP_LOG takes a full filter
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log: LogLevel,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report available, current, latest and installed versions
    CheckUpdates(PackageArgs),
    /// Install the latest version into a new environment
    Update(PackageArgs),
    /// Recreate the current version's environment
    Restore(PackageArgs),
    /// Install the version before the current one
    Revert(PackageArgs),
    /// Remove one version's environment
    Remove(PackageArgs),
    /// Clean broken environments, then restore the current version
    Reset(PackageArgs),
    /// Retire older versions once the latest is installed
    CheckLaunchClean(PackageArgs),
    /// Remove broken and quarantined environments
    Clean(PackageArgs),
    /// Remove the updater lock regardless of holder
    CleanLock(PackageArgs),
    /// Print the detected current version
    CheckVersion(PackageArgs),
    /// List the packages of the current environment
    CheckPackages(PackageArgs),
    /// Report whether an updater is running
    Status(PackageArgs),
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
struct PackageArgs {
    /// Package spec: `name`, `name=version` or `name=version=build`
    package: String,
    /// Channel to search and install from; repeatable
    #[arg(long = "channel", short = 'c')]
    channels: Vec<String>,
    /// Treat this as the running version instead of detecting it
    #[arg(long)]
    current_version: Option<String>,
    /// Plugin names to carry across updates; repeatable or comma separated
    #[arg(long, value_delimiter = ',')]
    plugins: Vec<String>,
    /// URL of a JSON plugin catalog
    #[arg(long)]
    plugins_url: Option<String>,
    /// Include development releases
    #[arg(long)]
    dev: bool,
    /// Do not create or remove menu shortcuts
    #[arg(long)]
    no_shortcuts: bool,
    /// Install updates without shortcuts; a later update activates them
    #[arg(long)]
    delayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log);

    match dispatch::run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            render::print_failure(&err)
        }
    }
}

#[cfg(test)]
mod tests;

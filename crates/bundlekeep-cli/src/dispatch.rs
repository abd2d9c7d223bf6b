use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use bundlekeep_core::VersionSpec;
use bundlekeep_installer::{default_base_prefix, CondaBackend, PrefixLayout};
use bundlekeep_manager::{
    Exclusion, Locked, Manager, ManagerConfig, ManagerOptions, RemoveReport, RestoreReport,
    UpdateOutcome,
};
use bundlekeep_registry::ChannelRegistry;
use serde::Serialize;
use tracing::{info, warn};

use crate::completion::write_completions_script;
use crate::render::{failure_payload, print_json, TerminalRenderer, TerminalSpinner, ALREADY_RUNNING};
use crate::{Cli, Commands, PackageArgs};

type CondaManager = Manager<CondaBackend, ChannelRegistry>;

pub(crate) fn run_cli(cli: Cli) -> Result<ExitCode> {
    let Cli {
        prefix, command, ..
    } = cli;

    match command {
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            write_completions_script(shell, &mut stdout)?;
            stdout.flush().context("failed flushing completion script")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckUpdates(args) => {
            let (manager, spec) = open_manager(prefix, &args)?;
            print_json(&manager.check_updates(&spec)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckVersion(args) => {
            let (manager, spec) = open_manager(prefix, &args)?;
            print_json(&manager.check_version(&spec)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckPackages(args) => {
            let (mut manager, spec) = open_manager(prefix, &args)?;
            print_json(&manager.check_packages(&spec)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status(args) => {
            let (manager, spec) = open_manager(prefix, &args)?;
            print_json(&manager.status(&spec))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CleanLock(args) => {
            let (manager, spec) = open_manager(prefix, &args)?;
            print_json(&manager.clean_lock(&spec)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Update(args) => {
            let (mut manager, spec) = open_mutating_manager(prefix, &args)?;
            let spinner = start_spinner("updating", &spec);
            emit_locked(manager.update(&spec)?, spinner, outcome_failure)
        }
        Commands::Revert(args) => {
            let (mut manager, spec) = open_mutating_manager(prefix, &args)?;
            let spinner = start_spinner("reverting", &spec);
            emit_locked(manager.revert(&spec)?, spinner, outcome_failure)
        }
        Commands::Restore(args) => {
            let (mut manager, spec) = open_mutating_manager(prefix, &args)?;
            let spinner = start_spinner("restoring", &spec);
            emit_locked(manager.restore(&spec)?, spinner, restore_failure)
        }
        Commands::Reset(args) => {
            let (mut manager, spec) = open_mutating_manager(prefix, &args)?;
            let spinner = start_spinner("resetting", &spec);
            emit_locked(manager.reset(&spec)?, spinner, |report| {
                restore_failure(&report.restore)
            })
        }
        Commands::Remove(args) => {
            let (mut manager, spec) = open_mutating_manager(prefix, &args)?;
            let spinner = start_spinner("removing", &spec);
            emit_locked(manager.remove(&spec)?, spinner, remove_failure)
        }
        Commands::Clean(args) => {
            let (mut manager, spec) = open_mutating_manager(prefix, &args)?;
            let spinner = start_spinner("cleaning", &spec);
            emit_locked(manager.clean(&spec)?, spinner, |_| None)
        }
        Commands::CheckLaunchClean(args) => {
            let (mut manager, spec) = open_mutating_manager(prefix, &args)?;
            let spinner = start_spinner("checking", &spec);
            emit_locked(manager.check_updates_and_clean(&spec)?, spinner, |_| None)
        }
    }
}

fn open_manager(prefix: Option<PathBuf>, args: &PackageArgs) -> Result<(CondaManager, VersionSpec)> {
    let spec = VersionSpec::parse(&args.package)?;
    let base = match prefix {
        Some(prefix) => prefix,
        None => default_base_prefix()?,
    };
    let layout = PrefixLayout::new(base);
    let config = ManagerConfig::load(&layout.config_path())?;

    let registry = ChannelRegistry::new(
        &config.catalog_url,
        Duration::from_secs(config.request_timeout_secs),
    )
    .context("failed to build channel catalog client")?;

    let mut plugin_catalog = args.plugins.clone();
    if let Some(url) = &args.plugins_url {
        let names = registry
            .fetch_plugin_names(url)
            .with_context(|| format!("failed to fetch plugin catalog from {url}"))?;
        info!(url = %url, count = names.len(), "loaded plugin catalog");
        plugin_catalog.extend(names);
    }

    let channels = resolve_channels(&args.channels, &config.default_channel);
    let program = CondaBackend::detect_program(layout.root(), config.backend.as_deref());
    let backend = CondaBackend::new(program, channels.clone());
    let options = ManagerOptions {
        channels,
        include_dev: args.dev,
        current_version: args.current_version.clone(),
        plugin_catalog,
        shortcuts: !args.no_shortcuts,
        delayed: args.delayed,
    };

    Ok((Manager::new(layout, backend, registry, options), spec))
}

fn open_mutating_manager(
    prefix: Option<PathBuf>,
    args: &PackageArgs,
) -> Result<(CondaManager, VersionSpec)> {
    let (manager, spec) = open_manager(prefix, args)?;
    manager.layout().ensure_base_dirs()?;
    Ok((manager, spec))
}

/// Repeated channels collapse to their first occurrence; none given means the configured default.
pub(crate) fn resolve_channels(requested: &[String], default_channel: &str) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    for channel in requested.iter().map(|channel| channel.trim()) {
        if !channel.is_empty() && !channels.iter().any(|seen| seen == channel) {
            channels.push(channel.to_string());
        }
    }
    if channels.is_empty() {
        channels.push(default_channel.to_string());
    }
    channels
}

fn start_spinner(action: &str, spec: &VersionSpec) -> TerminalSpinner {
    TerminalRenderer::current().start_spinner(&format!("{action} {}", spec.package_name))
}

fn emit_locked<T: Serialize>(
    locked: Locked<T>,
    spinner: TerminalSpinner,
    failure: impl Fn(&T) -> Option<String>,
) -> Result<ExitCode> {
    let (value, mutual_exclusion) = match locked {
        Locked::AlreadyRunning { holder } => {
            drop(spinner);
            if let Some(holder) = holder {
                info!(pid = holder.pid, "updater already running");
            }
            print_json(&ALREADY_RUNNING)?;
            return Ok(ExitCode::SUCCESS);
        }
        Locked::Ran {
            value,
            mutual_exclusion,
        } => (value, mutual_exclusion),
    };

    if mutual_exclusion == Exclusion::Unprotected {
        warn!("operation ran without holding the updater lock");
    }

    match failure(&value) {
        Some(message) => {
            spinner.finish("err");
            let payload = failure_payload(&message, serde_json::to_value(&value)?);
            println!("{payload:#}");
            Ok(ExitCode::FAILURE)
        }
        None => {
            spinner.finish(match mutual_exclusion {
                Exclusion::Held => "ok",
                Exclusion::Unprotected => "warn",
            });
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn outcome_failure(outcome: &UpdateOutcome) -> Option<String> {
    outcome.failure_detail().map(str::to_string)
}

pub(crate) fn restore_failure(report: &RestoreReport) -> Option<String> {
    report.failure_detail()
}

pub(crate) fn remove_failure(report: &RemoveReport) -> Option<String> {
    report.failure_detail()
}

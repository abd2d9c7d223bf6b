use std::path::PathBuf;

use bundlekeep_manager::{RemoveReport, RestoreReport};
use clap::error::ErrorKind;
use clap::Parser;
use serde_json::json;

use crate::completion::{write_completions_script, CliCompletionShell};
use crate::dispatch::{remove_failure, resolve_channels, restore_failure};
use crate::render::{
    failure_payload, render_json, resolve_output_style, status_badge, OutputStyle,
    ALREADY_RUNNING,
};
use crate::{Cli, Commands, LogLevel, PackageArgs};

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
fn update_collects_channels_plugins_and_flags() {
    let cli = Cli::try_parse_from([
        "bundlekeep",
        "update",
        "napari=0.4.19",
        "-c",
        "conda-forge",
        "--channel",
        "napari",
        "--plugins",
        "napari-svg,napari-console",
        "--plugins",
        "napari-animation",
        "--current-version",
        "0.4.18",
        "--dev",
    ])
    .expect("command must parse");

    match cli.command {
        Commands::Update(args) => {
            assert_eq!(args.package, "napari=0.4.19");
            assert_eq!(args.channels, strings(&["conda-forge", "napari"]));
            assert_eq!(
                args.plugins,
                strings(&["napari-svg", "napari-console", "napari-animation"])
            );
            assert_eq!(args.current_version.as_deref(), Some("0.4.18"));
            assert!(args.dev);
            assert_eq!(args.plugins_url, None);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = Cli::try_parse_from([
        "bundlekeep",
        "check-updates",
        "napari",
        "--prefix",
        "/opt/conda",
        "--log",
        "debug",
    ])
    .expect("command must parse");

    assert_eq!(
        cli.prefix.as_deref(),
        Some(std::path::Path::new("/opt/conda"))
    );
    assert_eq!(cli.log, LogLevel::Debug);
    assert!(matches!(cli.command, Commands::CheckUpdates(_)));
}

#[test]
fn log_level_defaults_to_warn() {
    let cli = Cli::try_parse_from(["bundlekeep", "status", "napari"]).expect("command must parse");
    assert_eq!(cli.log, LogLevel::Warn);
    assert_eq!(cli.log.as_str(), "warn");
}

#[test]
fn maintenance_subcommands_use_kebab_case_names() {
    let cases = [
        ("check-launch-clean", "CheckLaunchClean"),
        ("clean-lock", "CleanLock"),
        ("check-version", "CheckVersion"),
        ("check-packages", "CheckPackages"),
        ("restore", "Restore"),
        ("revert", "Revert"),
        ("remove", "Remove"),
        ("reset", "Reset"),
        ("clean", "Clean"),
    ];
    for (name, variant) in cases {
        let cli = Cli::try_parse_from(["bundlekeep", name, "napari"])
            .unwrap_or_else(|err| panic!("{name} must parse: {err}"));
        assert!(
            format!("{:?}", cli.command).starts_with(&format!("{variant}(")),
            "{name} parsed as {:?}",
            cli.command
        );
    }
}

#[test]
fn package_spec_is_required() {
    let err = Cli::try_parse_from(["bundlekeep", "update"]).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn unknown_subcommand_is_rejected() {
    let err = Cli::try_parse_from(["bundlekeep", "upgrade", "napari"]).expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
}

#[test]
fn package_args_default_to_no_overrides() {
    let cli = Cli::try_parse_from(["bundlekeep", "clean", "napari"]).expect("command must parse");
    match cli.command {
        Commands::Clean(args) => assert_eq!(
            args,
            PackageArgs {
                package: "napari".to_string(),
                ..PackageArgs::default()
            }
        ),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn channels_deduplicate_preserving_first_occurrence() {
    let requested = strings(&["napari", "conda-forge", "napari", " ", "conda-forge"]);
    assert_eq!(
        resolve_channels(&requested, "conda-forge"),
        strings(&["napari", "conda-forge"])
    );
}

#[test]
fn channels_fall_back_to_configured_default() {
    assert_eq!(resolve_channels(&[], "defaults"), strings(&["defaults"]));
}

#[test]
fn failure_payload_has_data_and_error_keys() {
    let payload = failure_payload("lock directory is read-only", json!({}));
    assert_eq!(
        payload,
        json!({ "data": {}, "error": "lock directory is read-only" })
    );
}

#[test]
fn failure_payload_carries_outcome_data() {
    let payload = failure_payload(
        "napari=0.5.0=** failed with exit code 1",
        json!({ "status": "partial_failure", "version": "0.5.0" }),
    );
    assert_eq!(payload["data"]["status"], "partial_failure");
    assert_eq!(payload["error"], "napari=0.5.0=** failed with exit code 1");
}

#[test]
fn already_running_renders_as_json_string() {
    assert_eq!(
        render_json(&ALREADY_RUNNING).expect("must render"),
        "\"ALREADY RUNNING!\""
    );
}

#[test]
fn output_style_follows_stderr_terminal() {
    assert_eq!(resolve_output_style(true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false), OutputStyle::Plain);
}

#[test]
fn status_badges_cover_known_statuses() {
    assert_eq!(status_badge("ok"), "[OK]");
    assert_eq!(status_badge("warn"), "[WARN]");
    assert_eq!(status_badge("err"), "[ERR]");
    assert_eq!(status_badge("pending"), "[..]");
}

#[test]
fn completions_parse_and_generate_for_each_shell() {
    let cli =
        Cli::try_parse_from(["bundlekeep", "completions", "bash"]).expect("command must parse");
    assert!(matches!(
        cli.command,
        Commands::Completions {
            shell: CliCompletionShell::Bash
        }
    ));

    for shell in [
        CliCompletionShell::Bash,
        CliCompletionShell::Zsh,
        CliCompletionShell::Fish,
        CliCompletionShell::Powershell,
    ] {
        let mut script = Vec::new();
        write_completions_script(shell, &mut script).expect("must write completions");
        let script = String::from_utf8(script).expect("completion script must be utf-8");
        assert!(script.contains("bundlekeep"), "{shell:?} script names the binary");
        assert!(script.contains("check-updates"), "{shell:?} script lists subcommands");
    }
}

#[test]
fn shortcut_and_delayed_flags_parse() {
    let cli = Cli::try_parse_from([
        "bundlekeep",
        "update",
        "napari",
        "--delayed",
        "--no-shortcuts",
    ])
    .expect("command must parse");
    match cli.command {
        Commands::Update(args) => {
            assert!(args.delayed);
            assert!(args.no_shortcuts);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

fn remove_report(backend_exit_code: Option<i32>, deleted_directly: bool) -> RemoveReport {
    RemoveReport {
        version: "0.4.18".to_string(),
        backend_exit_code,
        quarantined: None,
        deleted_directly,
        shortcuts: None,
        failures: Vec::new(),
    }
}

#[test]
fn remove_exits_nonzero_only_when_the_environment_survives() {
    assert_eq!(remove_failure(&remove_report(Some(0), false)), None);
    assert_eq!(remove_failure(&remove_report(Some(1), true)), None);
    assert_eq!(remove_failure(&remove_report(None, true)), None);

    let mut survived = remove_report(Some(1), false);
    assert_eq!(
        remove_failure(&survived).as_deref(),
        Some("removing 0.4.18 failed")
    );
    survived
        .failures
        .push("failed to quarantine /base/envs/napari-0.4.18".to_string());
    assert_eq!(
        remove_failure(&survived).as_deref(),
        Some("failed to quarantine /base/envs/napari-0.4.18")
    );

    let failure = failure_payload(
        &remove_failure(&survived).expect("must fail"),
        serde_json::to_value(&survived).expect("must encode"),
    );
    assert_eq!(failure["data"]["backend_exit_code"], 1);
    assert_eq!(failure["data"]["deleted_directly"], false);
}

#[test]
fn restore_exits_nonzero_when_recreate_fails() {
    let report = RestoreReport {
        version: "0.4.19".to_string(),
        exit_code: 1,
        quarantined: Some(PathBuf::from("/base/envs/napari-0.4.19-broken")),
        quarantine_kept: true,
        reinstated: true,
        shortcuts: None,
        failures: Vec::new(),
    };
    assert_eq!(
        restore_failure(&report).as_deref(),
        Some("recreating 0.4.19 failed with exit code 1")
    );
    assert_eq!(
        restore_failure(&RestoreReport {
            exit_code: 0,
            ..report
        }),
        None
    );
}

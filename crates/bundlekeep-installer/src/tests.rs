use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bundlekeep_core::PackageSource;

use crate::lifecycle::parse_environment_name;
use crate::{
    backend_args, base_prefix_from_conda_prefix, delete_environment, has_sentinel,
    installed_versions, list_broken, list_environments, load_deferred, load_snapshot,
    parse_list_output, quarantine, read_sentinel, reinstate, remove_sentinel, save_deferred,
    save_snapshot, sentinel_versions, write_sentinel, CondaBackend, DeferredDeletions,
    InstallerError, JobKind, JobRegistry, LifecycleError, LockError, LockHolder, PackageBackend,
    PrefixLayout, ProcessLock, Sentinel, UpdateSnapshot,
};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "bundlekeep-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> PrefixLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    PrefixLayout::new(build_test_layout_path(nanos))
}

fn sentinel(package_name: &str, version: &str) -> Sentinel {
    Sentinel {
        package_name: package_name.to_string(),
        version: version.to_string(),
        build_string: String::new(),
        plugins: Vec::new(),
        created_at_unix: 1,
    }
}

fn make_env(layout: &PrefixLayout, package_name: &str, version: &str) -> PathBuf {
    let prefix = layout.prefix_for(package_name, version);
    fs::create_dir_all(prefix.join("conda-meta")).expect("must create env");
    prefix
}

#[cfg(unix)]
fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("must spawn");
    let pid = child.id();
    child.wait().expect("must wait");
    pid
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    assert_ne!(build_test_layout_path(42), build_test_layout_path(42));
}

#[test]
fn layout_paths_are_derived_from_root() {
    let layout = PrefixLayout::new("/opt/conda");
    assert_eq!(
        layout.prefix_for("napari", "0.4.19"),
        Path::new("/opt/conda/envs/napari-0.4.19")
    );
    assert_eq!(
        layout.sentinel_path("napari", "0.4.19"),
        Path::new("/opt/conda/bundlekeep/sentinels/napari-0.4.19.json")
    );
    assert_eq!(
        layout.lock_path("napari"),
        Path::new("/opt/conda/bundlekeep/napari-updater.lock")
    );
    assert_eq!(
        layout.deferred_path("napari"),
        Path::new("/opt/conda/bundlekeep/state/napari-deferred.json")
    );
}

#[test]
fn conda_prefix_inside_envs_maps_to_base() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    let env = make_env(&layout, "napari", "0.4.19");

    assert_eq!(base_prefix_from_conda_prefix(layout.root()), layout.root());
    assert_eq!(base_prefix_from_conda_prefix(&env), layout.root());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn create_args_carry_channels_then_specs() {
    let args = backend_args(
        JobKind::Create,
        Path::new("/base/envs/napari-0.4.19"),
        &["conda-forge".to_string(), "napari".to_string()],
        &["napari=0.4.19".to_string(), "napari-svg".to_string()],
    );
    let args: Vec<String> = args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        args,
        vec![
            "create",
            "-y",
            "--prefix",
            "/base/envs/napari-0.4.19",
            "-c",
            "conda-forge",
            "-c",
            "napari",
            "napari=0.4.19",
            "napari-svg",
        ]
    );
}

#[test]
fn create_pins_its_first_spec_for_the_prefix() {
    let mut backend = CondaBackend::new("/nonexistent/bundlekeep/mamba", Vec::new());
    let prefix = Path::new("/base/envs/napari-0.4.19");
    let specs = vec!["napari=0.4.19=*pyside*".to_string(), "napari-svg".to_string()];

    let result = backend.create(&specs, prefix);

    assert!(matches!(result, Err(InstallerError::Spawn { .. })));
    assert_eq!(backend.pinned_for(prefix), Some("napari=0.4.19=*pyside*"));
    assert_eq!(backend.pinned_for(Path::new("/base/envs/napari-0.5.0")), None);
    assert!(backend.jobs().jobs().is_empty());
}

#[test]
fn shortcut_jobs_install_with_shortcuts_and_uninstall_by_name() {
    let prefix = Path::new("/base/envs/napari-0.4.19");
    let channels = ["conda-forge".to_string()];
    let menu = ["napari-menu=0.4.19".to_string()];
    let render = |kind| -> Vec<String> {
        backend_args(kind, prefix, &channels, &menu)
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    };

    assert_eq!(
        render(JobKind::InstallShortcuts),
        vec![
            "install",
            "-y",
            "--shortcuts",
            "--prefix",
            "/base/envs/napari-0.4.19",
            "-c",
            "conda-forge",
            "napari-menu=0.4.19",
        ]
    );
    assert_eq!(
        render(JobKind::Uninstall),
        vec![
            "remove",
            "-y",
            "--prefix",
            "/base/envs/napari-0.4.19",
            "napari-menu=0.4.19",
        ]
    );
}

#[test]
fn remove_and_list_args_ignore_channels() {
    let prefix = Path::new("/base/envs/napari-0.4.19");
    let channels = ["conda-forge".to_string()];
    let remove: Vec<String> = backend_args(JobKind::Remove, prefix, &channels, &[])
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        remove,
        vec!["remove", "-y", "--all", "--prefix", "/base/envs/napari-0.4.19"]
    );

    let list: Vec<String> = backend_args(JobKind::List, prefix, &channels, &[])
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        list,
        vec!["list", "--prefix", "/base/envs/napari-0.4.19", "--json"]
    );
}

#[test]
fn list_output_marks_pypi_packages_as_pip() {
    let stdout = r#"[
        {"name": "napari", "version": "0.4.19", "build_string": "pyh1_0", "platform": "noarch", "channel": "conda-forge"},
        {"name": "napari-svg", "version": "0.1.10", "build_string": "pypi_0", "platform": "pypi"}
    ]"#;
    let packages = parse_list_output(stdout).expect("must parse");
    assert_eq!(packages.len(), 2);
    assert_eq!(packages[0].source, PackageSource::Conda);
    assert_eq!(packages[0].build_string, "pyh1_0");
    assert_eq!(packages[1].source, PackageSource::Pip);
    assert!(packages.iter().all(|package| !package.is_plugin));
}

#[test]
fn list_output_rejects_non_json() {
    assert!(parse_list_output("CondaError: prefix not found").is_err());
}

#[test]
fn job_registry_reports_exit_codes_by_handle() {
    let mut jobs = JobRegistry::default();
    let ok = jobs.record(JobKind::Create, Path::new("/p"), &[], 0);
    let failed = jobs.record(JobKind::Install, Path::new("/p"), &["x".to_string()], 1);

    assert_ne!(ok, failed);
    assert_eq!(jobs.exit_code(ok), Some(0));
    assert_eq!(jobs.exit_code(failed), Some(1));
    assert_eq!(jobs.failed().count(), 1);
    assert_eq!(jobs.jobs().len(), 2);
}

#[test]
fn environment_names_split_version_and_quarantine() {
    assert_eq!(
        parse_environment_name("napari", "napari-0.4.19"),
        Some(("0.4.19".to_string(), false))
    );
    assert_eq!(
        parse_environment_name("napari", "napari-0.4.19-broken"),
        Some(("0.4.19".to_string(), true))
    );
    assert_eq!(
        parse_environment_name("napari", "napari-0.4.19-broken-2"),
        Some(("0.4.19".to_string(), true))
    );
    assert_eq!(parse_environment_name("napari", "napari-svg-0.1.10"), None);
    assert_eq!(parse_environment_name("napari", "napari-0.4.19-brokenx"), None);
    assert_eq!(parse_environment_name("napari", "other-0.4.19"), None);
}

#[test]
fn quarantine_picks_first_free_broken_name() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let first = quarantine(&make_env(&layout, "napari", "0.4.19")).expect("must quarantine");
    let second = quarantine(&make_env(&layout, "napari", "0.4.19")).expect("must quarantine");

    assert_eq!(first, layout.envs_dir().join("napari-0.4.19-broken"));
    assert_eq!(second, layout.envs_dir().join("napari-0.4.19-broken-1"));
    assert!(!layout.prefix_for("napari", "0.4.19").exists());

    let broken = list_broken(&layout, "napari").expect("must list");
    assert_eq!(broken, vec![first, second]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn reinstate_moves_copy_back_and_sets_the_occupant_aside() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    let prefix = make_env(&layout, "napari", "0.4.19");
    fs::write(prefix.join("conda-meta").join("history"), b"original").expect("must write");
    let kept = quarantine(&prefix).expect("must quarantine");
    make_env(&layout, "napari", "0.4.19");

    let displaced = reinstate(&kept, &prefix).expect("must reinstate");

    assert_eq!(
        displaced,
        Some(layout.envs_dir().join("napari-0.4.19-broken-1"))
    );
    assert!(!kept.exists());
    assert_eq!(
        fs::read(prefix.join("conda-meta").join("history")).expect("original must be back"),
        b"original"
    );
    assert!(matches!(
        reinstate(&layout.envs_dir().join("napari-0.4.19-broken-7"), &prefix),
        Err(LifecycleError::NotFound(_))
    ));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn list_broken_includes_environments_without_sentinel() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    make_env(&layout, "napari", "0.4.18");
    let unverified = make_env(&layout, "napari", "0.4.19");
    write_sentinel(&layout, &sentinel("napari", "0.4.18")).expect("must write");

    assert_eq!(
        list_broken(&layout, "napari").expect("must list"),
        vec![unverified]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn quarantine_missing_prefix_is_not_found() {
    let layout = test_layout();
    let err = quarantine(&layout.prefix_for("napari", "0.4.19")).expect_err("must fail");
    assert!(matches!(err, LifecycleError::NotFound(_)));
}

#[test]
fn list_environments_skips_files_and_other_packages() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    make_env(&layout, "napari", "0.4.18");
    make_env(&layout, "napari", "0.4.19");
    make_env(&layout, "napari-svg", "0.1.10");
    fs::write(layout.envs_dir().join("napari-0.5.0"), b"not a dir").expect("must write");

    let versions: Vec<String> = list_environments(&layout, "napari")
        .expect("must list")
        .into_iter()
        .map(|environment| environment.version)
        .collect();
    assert_eq!(versions, vec!["0.4.18", "0.4.19"]);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn list_environments_without_envs_dir_is_empty() {
    let layout = test_layout();
    assert!(list_environments(&layout, "napari")
        .expect("must list")
        .is_empty());
}

#[test]
fn delete_environment_removes_tree_and_reports_missing() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");
    let prefix = make_env(&layout, "napari", "0.4.19");
    fs::write(prefix.join("conda-meta").join("history"), b"x").expect("must write");

    delete_environment(&prefix).expect("must delete");
    assert!(!prefix.exists());
    assert!(matches!(
        delete_environment(&prefix),
        Err(LifecycleError::NotFound(_))
    ));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn sentinel_round_trip_and_removal() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    let mut marker = sentinel("napari", "0.4.19");
    marker.plugins = vec!["napari-svg".to_string()];
    write_sentinel(&layout, &marker).expect("must write");

    assert!(has_sentinel(&layout, "napari", "0.4.19"));
    assert_eq!(
        read_sentinel(&layout, "napari", "0.4.19").expect("must read"),
        Some(marker)
    );
    assert!(remove_sentinel(&layout, "napari", "0.4.19").expect("must remove"));
    assert!(!remove_sentinel(&layout, "napari", "0.4.19").expect("must remove"));
    assert_eq!(
        read_sentinel(&layout, "napari", "0.4.19").expect("must read"),
        None
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn installed_versions_require_sentinel_and_prefix() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    for version in ["0.4.10", "0.4.9", "0.4.18"] {
        write_sentinel(&layout, &sentinel("napari", version)).expect("must write");
    }
    write_sentinel(&layout, &sentinel("napari-svg", "0.1.10")).expect("must write");
    make_env(&layout, "napari", "0.4.9");
    make_env(&layout, "napari", "0.4.10");
    make_env(&layout, "napari", "0.4.19");

    assert_eq!(
        sentinel_versions(&layout, "napari").expect("must list"),
        vec!["0.4.9", "0.4.10", "0.4.18"]
    );
    assert_eq!(
        installed_versions(&layout, "napari").expect("must list"),
        vec!["0.4.9", "0.4.10"]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn snapshot_and_deferred_state_persist() {
    let layout = test_layout();
    layout.ensure_base_dirs().expect("must create dirs");

    assert_eq!(load_snapshot(&layout, "napari").expect("must load"), None);
    let snapshot = UpdateSnapshot {
        application: "napari".to_string(),
        current_version: "0.4.18".to_string(),
        target_version: "0.4.19".to_string(),
        packages: parse_list_output(r#"[{"name": "napari", "version": "0.4.18"}]"#)
            .expect("must parse"),
        channels: vec!["conda-forge".to_string()],
        dev: false,
        plugins: vec!["napari-svg".to_string()],
        saved_at_unix: 7,
    };
    save_snapshot(&layout, &snapshot).expect("must save");
    assert_eq!(
        load_snapshot(&layout, "napari").expect("must load"),
        Some(snapshot)
    );

    let empty = load_deferred(&layout, "napari").expect("must load");
    assert!(empty.paths.is_empty());
    let deferred = DeferredDeletions {
        package_name: "napari".to_string(),
        paths: vec![layout.prefix_for("napari", "0.4.17")],
    };
    save_deferred(&layout, &deferred).expect("must save");
    assert_eq!(load_deferred(&layout, "napari").expect("must load"), deferred);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn lock_is_exclusive_until_unlocked() {
    let layout = test_layout();
    let path = layout.lock_path("napari");

    let mut first = ProcessLock::new(&path, "napari");
    let mut second = ProcessLock::new(&path, "napari");
    assert!(first.lock().expect("must lock"));
    assert!(!second.lock().expect("must report busy"));
    assert!(!second.is_held());
    assert!(second.live_holder().expect("must read").is_some());

    let holder = second.holder().expect("must read").expect("must exist");
    assert_eq!(holder.pid, std::process::id());
    assert_eq!(holder.package_name, "napari");

    first.unlock().expect("must unlock");
    assert!(!path.exists());
    assert!(second.lock().expect("must lock"));

    drop(second);
    assert!(!path.exists(), "dropping a held lock must release it");

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn lock_left_by_exited_process_is_reclaimed() {
    let layout = test_layout();
    let path = layout.lock_path("napari");
    fs::create_dir_all(layout.manager_dir()).expect("must create dirs");
    let stale = LockHolder {
        pid: exited_pid(),
        package_name: "napari".to_string(),
        acquired_at_unix: 1,
        token: "stale".to_string(),
    };
    fs::write(&path, serde_json::to_vec(&stale).expect("encode")).expect("must write");

    let mut lock = ProcessLock::new(&path, "napari");
    assert!(lock.lock().expect("must reclaim"));
    assert_eq!(
        lock.holder().expect("must read").map(|holder| holder.pid),
        Some(std::process::id())
    );

    lock.unlock().expect("must unlock");
    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn corrupted_lock_is_reported_and_force_cleared() {
    let layout = test_layout();
    let path = layout.lock_path("napari");
    fs::create_dir_all(&path).expect("must create stray dir");

    let mut lock = ProcessLock::new(&path, "napari");
    assert!(matches!(lock.lock(), Err(LockError::Corrupted { .. })));

    assert!(lock.force_clear().expect("must clear"));
    assert!(!lock.force_clear().expect("must clear"));
    assert!(lock.lock().expect("must lock"));

    drop(lock);
    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn garbage_lock_content_is_corrupted() {
    let layout = test_layout();
    let path = layout.lock_path("napari");
    fs::create_dir_all(layout.manager_dir()).expect("must create dirs");
    fs::write(&path, b"").expect("must write");

    let mut lock = ProcessLock::new(&path, "napari");
    assert!(matches!(lock.lock(), Err(LockError::Corrupted { .. })));
    assert!(!lock.is_held());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn contended_lock_has_a_single_holder_at_a_time() {
    let layout = test_layout();
    let path = layout.lock_path("napari");
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let acquired = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let barrier = Arc::new(Barrier::new(6));
        let workers: Vec<_> = (0..6)
            .map(|_| {
                let (path, barrier) = (path.clone(), Arc::clone(&barrier));
                let (active, peak, acquired) =
                    (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&acquired));
                thread::spawn(move || {
                    let mut lock = ProcessLock::new(&path, "napari");
                    barrier.wait();
                    if lock.lock().expect("lock must never look corrupted") {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        acquired.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        active.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock().expect("must unlock");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker must not panic");
        }
        assert!(!path.exists(), "every holder must release its claim");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(acquired.load(Ordering::SeqCst) >= 50);
    let leftovers: Vec<_> = fs::read_dir(layout.manager_dir())
        .expect("must list")
        .filter_map(Result::ok)
        .filter(|entry| entry.path() != path)
        .collect();
    assert!(leftovers.is_empty(), "staged claims must be cleaned up");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn unlock_leaves_a_lock_it_does_not_own() {
    let layout = test_layout();
    let path = layout.lock_path("napari");

    let mut first = ProcessLock::new(&path, "napari");
    assert!(first.lock().expect("must lock"));
    let other = LockHolder {
        pid: std::process::id(),
        package_name: "napari".to_string(),
        acquired_at_unix: 2,
        token: "someone-else".to_string(),
    };
    fs::write(&path, serde_json::to_vec(&other).expect("encode")).expect("must write");
    first.unlock().expect("must unlock");
    assert_eq!(first.holder().expect("must read"), Some(other));

    fs::remove_file(&path).expect("must remove");
    let mut second = ProcessLock::new(&path, "napari");
    assert!(second.lock().expect("must lock"));
    fs::write(&path, b"").expect("must truncate");
    second.unlock().expect("unreadable lock is not an error");
    assert!(path.exists(), "an unreadable lock is left for clean-lock");

    let _ = fs::remove_dir_all(layout.root());
}

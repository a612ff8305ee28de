#![cfg(unix)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use provisioner::engine;
use provisioner::executor::RunContext;
use provisioner::manifest::{self, LoadOptions, Manifest};
use provisioner::report::{FetchStatus, Reporter, RunReport};
use provisioner::transport::Environment;

fn write_manifest(root: &Path, body: &str) -> PathBuf {
    let path = root.join("manifest.toml");
    fs::write(&path, body).unwrap();
    path
}

fn load(root: &Path, body: &str) -> Manifest {
    let path = write_manifest(root, body);
    let opts = LoadOptions {
        install_root: Some(root.to_path_buf()),
        groups: BTreeSet::new(),
    };
    manifest::load(&path, &opts).unwrap()
}

fn run(m: &Manifest, env: &mut Environment, dry_run: bool) -> (RunReport, PathBuf) {
    let reporter = Arc::new(Reporter::create(&m.settings.log_dir).unwrap());
    let log_path = reporter.log_path().to_path_buf();
    let ctx = RunContext::new(dry_run, m.settings.retry_bound, reporter);
    let report = engine::run(m, env, &ctx).unwrap();
    (report, log_path)
}

fn fake_bin(dir: &Path, name: &str, script: &str) {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn statuses(report: &RunReport) -> Vec<FetchStatus> {
    report.results.iter().map(|r| r.status).collect()
}

/// Fake-tool dir first so its binaries shadow the real ones, system PATH
/// after so git stays reachable.
fn path_with(front: PathBuf) -> Vec<PathBuf> {
    let mut dirs = vec![front];
    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }
    dirs
}

fn git_usable() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[test]
fn one_bad_url_does_not_abort_the_run() {
    if !git_usable() {
        eprintln!("git unavailable; skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    // Present tool; its failing body doubles as the broken aria2 transport.
    fake_bin(&bin, "aria2c", "exit 1");

    let origin = root.path().join("origin");
    fs::create_dir_all(&origin).unwrap();
    for args in [
        vec!["init", "-q"],
        vec![
            "-c",
            "user.name=t",
            "-c",
            "user.email=t@t",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            "init",
        ],
    ] {
        let ok = Command::new("git")
            .arg("-C")
            .arg(&origin)
            .args(&args)
            .status()
            .unwrap()
            .success();
        assert!(ok, "git {args:?} failed");
    }

    let m = load(
        root.path(),
        &format!(
            r#"
[[tools]]
name = "aria2"
bin = "aria2c"
install = ["sh", "-c", "exit 99"]

[[files]]
name = "vae.safetensors"
url = "http://127.0.0.1:9/vae.safetensors"
destination = "models/vae.safetensors"

[[git_repos]]
name = "repo-x"
url = "{}"
destination = "nodes/repo-x"
"#,
            origin.display()
        ),
    );

    let mut env = Environment::from_path_dirs(path_with(bin), None);
    let (report, log_path) = run(&m, &mut env, false);

    assert_eq!(
        statuses(&report),
        vec![
            FetchStatus::Skipped,
            FetchStatus::Failed,
            FetchStatus::Succeeded
        ]
    );
    assert!(!report.ok);

    // Failing transport ran exactly 1 + retry_bound times.
    let failed = &report.results[1];
    assert_eq!(failed.attempts, 1 + m.settings.retry_bound);
    assert!(failed.error_detail.is_some());

    assert!(root.path().join("nodes/repo-x/.git").exists());

    let log = fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("SKIP: aria2"), "log:\n{log}");
    assert!(log.contains("FAIL: vae.safetensors"), "log:\n{log}");
    assert!(log.contains("OK: repo-x"), "log:\n{log}");
    assert!(log.contains("1 failed / 3 total"), "log:\n{log}");
}

#[test]
fn second_run_skips_everything_the_first_run_completed() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    fs::create_dir_all(&bin).unwrap();

    let model = root.path().join("models").join("base.bin");
    fs::create_dir_all(model.parent().unwrap()).unwrap();
    fs::write(&model, b"weights").unwrap();

    let install_script = format!(
        "printf '#!/bin/sh\\nexit 0\\n' > {bin}/mytool && chmod +x {bin}/mytool",
        bin = bin.display()
    );
    let body = format!(
        r#"
[[tools]]
name = "mytool"
install = ["sh", "-c", "{install_script}"]

[[files]]
name = "base.bin"
url = "http://127.0.0.1:9/base.bin"
destination = "models/base.bin"
size = 7
"#
    );
    let m = load(root.path(), &body);

    let mut env = Environment::from_path_dirs(vec![bin.clone()], None);
    let (first, _) = run(&m, &mut env, false);
    assert_eq!(
        statuses(&first),
        vec![FetchStatus::Succeeded, FetchStatus::Skipped]
    );

    let mut env = Environment::from_path_dirs(vec![bin], None);
    let (second, _) = run(&m, &mut env, false);
    assert_eq!(
        statuses(&second),
        vec![FetchStatus::Skipped, FetchStatus::Skipped]
    );
    assert!(second.ok);
}

#[test]
fn pinned_version_mismatch_reinstalls_unpinned_skips() {
    let root = tempfile::tempdir().unwrap();
    let bin = root.path().join("bin");
    fake_bin(&bin, "verold1", "echo 1.0.0");
    fake_bin(&bin, "verold2", "echo 1.0.0");
    let pinned_marker = root.path().join("pinned-ran");
    let loose_marker = root.path().join("loose-ran");

    let m = load(
        root.path(),
        &format!(
            r#"
[[tools]]
name = "pinned-tool"
bin = "verold1"
version = "2.0.0"
pinned = true
install = ["sh", "-c", "touch {p}"]

[[tools]]
name = "loose-tool"
bin = "verold2"
version = "2.0.0"
install = ["sh", "-c", "touch {l}"]
"#,
            p = pinned_marker.display(),
            l = loose_marker.display()
        ),
    );

    let mut env = Environment::from_path_dirs(vec![bin], None);
    let (report, _) = run(&m, &mut env, false);
    assert_eq!(
        statuses(&report),
        vec![FetchStatus::Succeeded, FetchStatus::Skipped]
    );
    assert!(pinned_marker.is_file());
    assert!(!loose_marker.exists());
    assert_eq!(
        report.results[1].note.as_deref(),
        Some("present, version differs (not pinned)")
    );
}

#[test]
fn parallel_batch_keeps_manifest_order_in_the_report() {
    let root = tempfile::tempdir().unwrap();
    for name in ["a.bin", "b.bin", "c.bin"] {
        fs::write(root.path().join(name), b"x").unwrap();
    }
    let m = load(
        root.path(),
        r#"
[settings]
max_parallel = 3

[[files]]
name = "a.bin"
url = "http://127.0.0.1:9/a.bin"
size = 1

[[files]]
name = "b.bin"
url = "http://127.0.0.1:9/b.bin"
size = 1

[[files]]
name = "c.bin"
url = "http://127.0.0.1:9/c.bin"
size = 1
"#,
    );

    let mut env = Environment::from_path_dirs(Vec::new(), None);
    let (report, _) = run(&m, &mut env, false);
    let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a.bin", "b.bin", "c.bin"]);
    assert_eq!(report.counts(), (3, 0, 0));
}

#[test]
fn dry_run_fetches_nothing_and_records_skips() {
    let root = tempfile::tempdir().unwrap();
    let m = load(
        root.path(),
        r#"
[[files]]
name = "vae.bin"
url = "http://127.0.0.1:9/vae.bin"
destination = "models/vae.bin"
"#,
    );

    let mut env = Environment::from_path_dirs(Vec::new(), None);
    let (report, _) = run(&m, &mut env, true);
    assert_eq!(statuses(&report), vec![FetchStatus::Skipped]);
    assert_eq!(
        report.results[0].note.as_deref(),
        Some("dry-run")
    );
    assert!(!root.path().join("models/vae.bin").exists());
}

#[test]
fn size_mismatch_refetches_and_reports_failure_when_unreachable() {
    let root = tempfile::tempdir().unwrap();
    let stale = root.path().join("model.bin");
    fs::write(&stale, b"truncated").unwrap();

    let m = load(
        root.path(),
        r#"
[settings]
retry_bound = 0

[[files]]
name = "model.bin"
url = "http://127.0.0.1:9/model.bin"
size = 4096
"#,
    );

    let mut env = Environment::from_path_dirs(Vec::new(), None);
    let (report, _) = run(&m, &mut env, false);
    assert_eq!(statuses(&report), vec![FetchStatus::Failed]);
    assert_eq!(report.results[0].attempts, 1);
}

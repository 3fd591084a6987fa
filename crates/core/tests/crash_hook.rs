use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use slomo_core::logging::{install_panic_hook, PanicHookInstallPlan, CRASH_DIR_NAME, LOG_DIR_NAME};
use tempfile::tempdir;

const MODE_ENV: &str = "SLOMO_PANIC_CHILD_MODE";
const DATA_DIR_ENV: &str = "SLOMO_PANIC_CHILD_DATA_DIR";

/// Re-run this test binary, filtered to the child entrypoint, so the panic
/// happens in a separate process.
fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(MODE_ENV, mode)
        .env(DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_logs(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(DATA_DIR_ENV).expect("data dir must be set"));

    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::Installed { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "write" => panic!("interpolation worker exploded"),
        "unwritable" => {
            let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
            fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            fs::write(&crash_dir, b"not a directory").expect("occupy crash path");
            panic!("panic with an unwritable crash directory");
        }
        other => panic!("unknown child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_crash_file() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let logs = crash_logs(&data_dir.path().join(LOG_DIR_NAME).join(CRASH_DIR_NAME));
    let newest = logs.last().expect("expected a crash artifact");
    let contents = fs::read_to_string(newest).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=interpolation worker exploded"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn crash_hook_survives_unwritable_crash_dir() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("unwritable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic with an unwritable crash directory"));
    assert!(stderr.contains("Warning: failed to write crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}

//! Single-instance enforcement and `stop` against nothing.

use sertap::config::Config;
use sertap::supervisor::{self, PidFile, StopOutcome};

fn config_in(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.paths.runtime_dir = dir.join("run").to_string_lossy().into_owned();
    config.paths.log_root = dir.join("logs").to_string_lossy().into_owned();
    std::fs::create_dir_all(&config.paths.runtime_dir).expect("runtime dir");
    config
}

#[test]
fn duplicate_instance_refused_while_pid_file_held() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let pid_path = config.pid_path("t42");

    let held = PidFile::acquire(&pid_path).expect("first acquire");
    let duplicate = PidFile::acquire(&pid_path);
    assert!(duplicate.is_err(), "second instance must be refused");

    held.release();
    assert!(!pid_path.exists(), "release must remove the PID file");
}

#[test]
fn stale_pid_file_does_not_block_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let pid_path = config.pid_path("t42");

    // A crashed instance leaves the file behind but the kernel dropped its
    // lock, so the next start takes the file over.
    std::fs::write(&pid_path, "999999999\n").expect("stale file");
    let reacquired = PidFile::acquire(&pid_path).expect("acquire over stale file");
    reacquired.release();
}

#[tokio::test]
async fn stop_with_nothing_running_reports_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());

    let outcome = supervisor::stop_instance(&config, "t-none")
        .await
        .expect("stop must not error");
    assert_eq!(outcome, StopOutcome::NothingRunning);
}

#[tokio::test]
async fn stop_cleans_up_stale_pid_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let pid_path = config.pid_path("t-stale");
    std::fs::write(&pid_path, "999999999\n").expect("stale file");

    let outcome = supervisor::stop_instance(&config, "t-stale")
        .await
        .expect("stop must not error");
    assert_eq!(outcome, StopOutcome::NothingRunning);
    assert!(!pid_path.exists(), "stale PID file should be removed");
}

#[test]
fn find_instance_ignores_dead_pids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());
    let pid_path = config.pid_path("t-dead");
    std::fs::write(&pid_path, "999999999\n").expect("stale file");

    assert_eq!(supervisor::find_instance(&config, "t-dead"), None);
}

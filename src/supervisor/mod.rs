//! Supervisor: process lifecycle around the three bridge workers.
//!
//! Enforces one running instance per stream identifier through a PID file
//! held under an exclusive lock, constructs the queues and stop flags and
//! hands them to the workers (no ambient globals), then parks on
//! SIGINT/SIGTERM. Shutdown is cooperative: flip every stop flag, poke the
//! persistence queue with a wake sentinel, and give each worker a bounded
//! window to report back before giving up on it.
//!
//! The persistence worker gets its own OS thread (with its scheduling
//! priority lowered) and a current-thread runtime, isolating file I/O from
//! the two streaming workers. The producers cannot block on it regardless:
//! every enqueue in the bridge is a `try_send`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use log::{error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::TcpListener;

use crate::bridge::persist::PersistenceWorker;
use crate::bridge::proxy::NetworkProxy;
use crate::bridge::reader::DeviceReader;
use crate::bridge::{net_queue, persist_queue, wake_persist, StopFlag};
use crate::config::Config;
use crate::device::DeviceChannel;
use crate::metrics;

/// Bounded join windows at shutdown.
const STREAM_WORKER_JOIN: Duration = Duration::from_secs(10);
const PERSIST_WORKER_JOIN: Duration = Duration::from_secs(30);

/// How long `stop` waits for a signalled instance to exit.
const STOP_WAIT: Duration = Duration::from_secs(10);

/// Everything `start` needs beyond the config file.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub test_id: String,
    pub device: String,
    pub baud_rate: u32,
    /// Listen port for the network proxy; `None` disables the proxy worker.
    pub listen: Option<u16>,
}

/// PID file held under an fs2 exclusive lock for the daemon's lifetime.
///
/// The lock, not the file's existence, is the single-instance guard: a
/// crashed instance leaves a stale file whose lock the kernel has already
/// released, so the next start simply takes it over.
pub struct PidFile {
    file: std::fs::File,
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening PID file {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            let holder = read_pid(path)
                .map(|pid| format!(" (held by PID {pid})"))
                .unwrap_or_default();
            bail!(
                "another instance already owns {}{}",
                path.display(),
                holder
            );
        }
        let mut file = file;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(PidFile {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Unlock and remove. Called at the end of an orderly shutdown.
    pub fn release(self) {
        let _ = fs2::FileExt::unlock(&self.file);
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove PID file {}: {}", self.path.display(), e);
        }
    }
}

/// Read a PID out of a PID file, if it parses.
pub fn read_pid(path: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// Probe whether a PID refers to a live process (signal 0).
pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Locate the PID of a running instance for `test_id`: PID file first,
/// process-table scan as the fallback for a lost or corrupted file.
pub fn find_instance(config: &Config, test_id: &str) -> Option<i32> {
    if let Some(pid) = read_pid(&config.pid_path(test_id)) {
        if process_alive(pid) {
            return Some(pid);
        }
    }
    scan_process_table(test_id)
}

/// Walk /proc for a `sertap start` whose arguments name `test_id`.
fn scan_process_table(test_id: &str) -> Option<i32> {
    let own_pid = std::process::id() as i32;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let pid: i32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        if pid == own_pid {
            continue;
        }
        let cmdline = match std::fs::read(entry.path().join("cmdline")) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        let args: Vec<&str> = cmdline
            .split(|b| *b == 0)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .filter(|s| !s.is_empty())
            .collect();
        if cmdline_matches(&args, test_id) {
            return Some(pid);
        }
    }
    None
}

/// True when a command line names this binary, the `start` subcommand, and
/// `test_id` as the value of the `--test-id`/`-t` flag. Matching the flag's
/// value specifically keeps an unrelated instance whose device path happens
/// to equal the id from being signalled.
fn cmdline_matches(args: &[&str], test_id: &str) -> bool {
    let is_sertap = args
        .first()
        .map(|a| a.ends_with("sertap"))
        .unwrap_or(false);
    if !is_sertap || !args.iter().any(|a| *a == "start") {
        return false;
    }
    let assigned = format!("--test-id={test_id}");
    args.windows(2)
        .any(|pair| (pair[0] == "--test-id" || pair[0] == "-t") && pair[1] == test_id)
        || args.iter().any(|a| *a == assigned)
}

/// Outcome of a `stop` invocation.
#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NothingRunning,
}

/// Signal a running instance and wait (bounded) for it to exit.
pub async fn stop_instance(config: &Config, test_id: &str) -> Result<StopOutcome> {
    let pid = match find_instance(config, test_id) {
        Some(pid) => pid,
        None => {
            // Clean up a stale PID file so the next start is quiet about it.
            let path = config.pid_path(test_id);
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
            return Ok(StopOutcome::NothingRunning);
        }
    };

    info!("Sending SIGTERM to instance {} (PID {})", test_id, pid);
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| anyhow!("failed to signal PID {pid}: {e}"))?;

    let deadline = tokio::time::Instant::now() + STOP_WAIT;
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            warn!("PID {} still running after {:?}", pid, STOP_WAIT);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(StopOutcome::Stopped)
}

/// Run the bridge until a termination signal arrives.
///
/// Fatal startup conditions (duplicate instance, uncreatable directories,
/// unbindable listener, unstartable worker thread) error out before any
/// worker runs; after that point every failure is a logged, non-fatal
/// operational event.
pub async fn run(config: Config, options: StartOptions) -> Result<()> {
    std::fs::create_dir_all(&config.paths.runtime_dir)
        .with_context(|| format!("creating runtime dir {}", config.paths.runtime_dir))?;
    let pid_file = PidFile::acquire(&config.pid_path(&options.test_id))?;

    let log_dir = config.log_dir(&options.test_id);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    // The listener binds before any worker starts so an occupied port is a
    // startup error, not a silent proxy failure.
    let listener = match options.listen {
        Some(port) => Some(
            TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("binding proxy listener on port {port}"))?,
        ),
        None => None,
    };

    let channel = Arc::new(DeviceChannel::new(&options.device, options.baud_rate));
    let (net_tx, net_rx) = net_queue(config.bridge.queue_capacity);
    let (persist_tx, persist_rx) = persist_queue(config.bridge.queue_capacity);

    let reader_stop = StopFlag::new();
    let proxy_stop = StopFlag::new();
    let persist_stop = StopFlag::new();

    let reader = DeviceReader::new(
        Arc::clone(&channel),
        net_tx,
        persist_tx.clone(),
        reader_stop.clone(),
    );
    tokio::spawn(reader.run());

    if let Some(listener) = listener {
        let proxy = NetworkProxy::new(
            listener,
            Arc::clone(&channel),
            net_rx,
            persist_tx.clone(),
            proxy_stop.clone(),
        );
        tokio::spawn(proxy.run());
    } else {
        // No proxy: mark its flag stopped so shutdown does not wait on it,
        // and drop the receiver so reader enqueues are discarded cheaply.
        proxy_stop.mark_stopped();
        drop(net_rx);
        info!("No listen port configured; network proxy disabled");
    }

    let worker = PersistenceWorker::new(
        persist_rx,
        log_dir,
        Duration::from_secs(config.bridge.rotate_interval_secs),
        persist_stop.clone(),
    );
    spawn_persistence_thread(worker)?;

    info!("sertap bridge running for test '{}'", options.test_id);
    wait_for_termination().await;

    info!("Shutting down bridge workers");
    reader_stop.request_stop();
    proxy_stop.request_stop();
    persist_stop.request_stop();
    wake_persist(&persist_tx);

    if !reader_stop.wait_stopped(STREAM_WORKER_JOIN).await {
        error!("Device reader did not stop within {:?}", STREAM_WORKER_JOIN);
    }
    if !proxy_stop.wait_stopped(STREAM_WORKER_JOIN).await {
        error!("Network proxy did not stop within {:?}", STREAM_WORKER_JOIN);
    }
    if !persist_stop.wait_stopped(PERSIST_WORKER_JOIN).await {
        error!(
            "Persistence worker did not stop within {:?}",
            PERSIST_WORKER_JOIN
        );
    }

    let stats = metrics::snapshot();
    info!(
        "Bridge stopped: {} device lines, {} records written, {} forwarded, {} dropped (net {}, persist {}), {} reconnects, {} client sessions",
        stats.device_lines_read,
        stats.records_written,
        stats.events_forwarded,
        stats.net_queue_drops + stats.persist_queue_drops,
        stats.net_queue_drops,
        stats.persist_queue_drops,
        stats.serial_reopens,
        stats.client_sessions,
    );

    pid_file.release();
    Ok(())
}

/// Dedicated thread + current-thread runtime for the persistence worker.
fn spawn_persistence_thread(worker: PersistenceWorker) -> Result<()> {
    std::thread::Builder::new()
        .name("persistence".to_string())
        .spawn(move || {
            // Lower priority so record writing never competes with the two
            // streaming workers for CPU.
            #[cfg(unix)]
            unsafe {
                libc::nice(10);
            }
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(worker.run()),
                Err(e) => error!("Persistence runtime failed to start: {}", e),
            }
        })
        .context("spawning persistence worker thread")?;
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
            _ = term.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt");
    }
}

//! Binary entrypoint for the sertap CLI.
//!
//! Commands:
//! - `start --test-id <id> [--device <path>] [--baud <rate>] [--listen <port>]` - run the bridge
//! - `stop --test-id <id>` - terminate a running instance (exit 3 when none found)
//! - `status --test-id <id>` - report whether an instance is running
//! - `dump <file> [--json]` - inspect a record file
//!
//! Exit codes: 0 success, 1 fatal startup failure, 2 configuration error,
//! 3 stop/status found nothing running.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use sertap::config::{self, Config};
use sertap::logutil::escape_log;
use sertap::record::RecordReader;
use sertap::supervisor::{self, StartOptions, StopOutcome};

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_NOT_RUNNING: i32 = 3;

#[derive(Parser)]
#[command(name = "sertap")]
#[command(about = "Serial observer bridge: device serial line to TCP client and binary log")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "sertap.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge daemon for one test stream
    Start {
        /// Stream identifier; namespaces the PID file and log directory
        #[arg(short, long)]
        test_id: String,

        /// Serial device path (overrides config)
        #[arg(short, long)]
        device: Option<String>,

        /// Baud rate from the hardware allow-list (overrides config)
        #[arg(short, long)]
        baud: Option<u32>,

        /// TCP listen port for the network proxy; omit to disable the proxy
        #[arg(short, long)]
        listen: Option<u16>,

        /// Run as a background daemon (Unix only)
        #[arg(long)]
        daemon: bool,
    },
    /// Stop a running instance for a test stream
    Stop {
        /// Stream identifier of the instance to stop
        #[arg(short, long)]
        test_id: String,
    },
    /// Report whether an instance is running for a test stream
    Status {
        /// Stream identifier to query
        #[arg(short, long)]
        test_id: String,
    },
    /// Inspect a record file using length-prefixed framing
    Dump {
        /// Record file path
        file: String,

        /// Emit one JSON object per record instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load_or_default(&cli.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Start {
            test_id,
            device,
            baud,
            listen,
            daemon,
        } => {
            if let Err(e) = config::validate_test_id(&test_id) {
                eprintln!("Error: {e}");
                std::process::exit(EXIT_CONFIG);
            }
            let baud_rate = baud.unwrap_or(config.serial.baud_rate);
            if let Err(e) = config::validate_baud(baud_rate) {
                eprintln!("Error: {e}");
                std::process::exit(EXIT_CONFIG);
            }

            // Daemon mode respawns before logging so the child owns the log.
            #[cfg(unix)]
            if daemon {
                daemonize_process(&config)?;
            }
            #[cfg(not(unix))]
            if daemon {
                eprintln!("Error: daemon mode requires a Unix platform.");
                std::process::exit(EXIT_CONFIG);
            }

            init_logging(&config, cli.verbose);
            info!("Starting sertap v{}", env!("CARGO_PKG_VERSION"));

            let options = StartOptions {
                test_id,
                device: device.unwrap_or_else(|| config.serial.port.clone()),
                baud_rate,
                listen,
            };
            if let Err(e) = supervisor::run(config, options).await {
                error!("{:#}", e);
                std::process::exit(EXIT_FATAL);
            }
        }
        Commands::Stop { test_id } => {
            init_logging(&config, cli.verbose);
            if let Err(e) = config::validate_test_id(&test_id) {
                eprintln!("Error: {e}");
                std::process::exit(EXIT_CONFIG);
            }
            match supervisor::stop_instance(&config, &test_id).await? {
                StopOutcome::Stopped => info!("Instance '{}' stopped", test_id),
                StopOutcome::NothingRunning => {
                    // Callers treat this as a non-fatal "already down".
                    println!("No running instance for '{test_id}'");
                    std::process::exit(EXIT_NOT_RUNNING);
                }
            }
        }
        Commands::Status { test_id } => {
            init_logging(&config, cli.verbose);
            if let Err(e) = config::validate_test_id(&test_id) {
                eprintln!("Error: {e}");
                std::process::exit(EXIT_CONFIG);
            }
            match supervisor::find_instance(&config, &test_id) {
                Some(pid) => println!("sertap '{test_id}' running (PID {pid})"),
                None => {
                    println!("sertap '{test_id}' not running");
                    std::process::exit(EXIT_NOT_RUNNING);
                }
            }
        }
        Commands::Dump { file, json } => {
            init_logging(&config, cli.verbose);
            dump_records(&file, json)?;
        }
    }

    Ok(())
}

/// Print every record in a file, framed strictly by length prefix so
/// payloads containing line breaks come back intact.
fn dump_records(path: &str, json: bool) -> Result<()> {
    let file = std::fs::File::open(path)?;
    let mut reader = RecordReader::new(std::io::BufReader::new(file));
    let mut count = 0usize;
    while let Some(event) = reader.read_record()? {
        let (secs, micros) = event.timestamp_parts();
        if json {
            let payload = String::from_utf8_lossy(&event.payload);
            println!(
                "{}",
                serde_json::json!({
                    "direction": event.direction.to_string(),
                    "ts_seconds": secs,
                    "ts_micros": micros,
                    "payload": payload,
                })
            );
        } else {
            println!(
                "{secs}.{micros:06} [{}] {}",
                event.direction,
                escape_log(&event.payload)
            );
        }
        count += 1;
    }
    if !json {
        eprintln!("{count} records");
    }
    Ok(())
}

fn init_logging(config: &Config, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(ref file) = config.logging.file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

            // Foreground runs mirror to the console; in daemon mode stdout
            // is redirected so the mirror stays quiet.
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            builder.format(default_log_format);
        }
    } else {
        builder.format(default_log_format);
    }
    let _ = builder.try_init();
}

fn default_log_format(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    use std::io::Write;
    writeln!(
        fmt,
        "{} [{}] {}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        record.level(),
        record.args()
    )
}

/// Daemonize the process (Unix only)
///
/// Respawns the current invocation without `--daemon`, with stdin nulled and
/// stdout/stderr appended to the log file, then exits the parent. The child
/// acquires the PID file itself during startup.
#[cfg(unix)]
fn daemonize_process(config: &Config) -> Result<()> {
    use std::fs::OpenOptions;
    use std::process::Command;

    let log_path = config.logging.file.as_deref().unwrap_or("sertap.log");

    let current_exe = std::env::current_exe()?;
    let mut args: Vec<String> = std::env::args().collect();

    // Remove the --daemon flag to prevent infinite respawn
    if let Some(pos) = args.iter().position(|arg| arg == "--daemon") {
        args.remove(pos);
    }
    let child_args = &args[1..];

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let child = Command::new(&current_exe)
        .args(child_args)
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    eprintln!("sertap daemon started (PID {})", child.id());
    std::process::exit(0);
}

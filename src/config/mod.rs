//! Configuration management.
//!
//! sertap runs fine with no config file at all: every value has a default
//! and the few that matter operationally (`--device`, `--baud`, `--listen`)
//! are usually given on the command line, which always wins. The TOML file
//! exists for site-specific paths and the rotation interval.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [bridge]
//! queue_capacity = 1024
//! rotate_interval_secs = 900
//!
//! [paths]
//! runtime_dir = "/tmp"
//! log_root = "logs"
//!
//! [logging]
//! # file = "sertap.log"
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Baud rates the testbed hardware is known to support.
pub const ALLOWED_BAUD_RATES: &[u32] = &[
    9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Capacity of each bounded event queue. Producers drop (never block)
    /// once a queue is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds between record-file rotations.
    #[serde(default = "default_rotate_interval")]
    pub rotate_interval_secs: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_rotate_interval() -> u64 {
    900
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            queue_capacity: default_queue_capacity(),
            rotate_interval_secs: default_rotate_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where PID files live, one per stream identifier.
    pub runtime_dir: String,
    /// Root under which each stream identifier gets its own log directory.
    pub log_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            runtime_dir: "/tmp".to_string(),
            log_root: "logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Optional daemon log file. When unset, logs go to stderr only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from a TOML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {path}"))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config file {path}"))?;
        Ok(config)
    }

    /// Load from a TOML file, falling back to defaults when it is absent.
    /// A file that exists but fails to parse is still an error.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        match fs::metadata(path).await {
            Ok(_) => Self::load(path).await,
            Err(_) => Ok(Config::default()),
        }
    }

    /// PID file for a stream identifier.
    pub fn pid_path(&self, test_id: &str) -> PathBuf {
        PathBuf::from(&self.paths.runtime_dir).join(format!("sertap-{test_id}.pid"))
    }

    /// Record-file directory for a stream identifier.
    pub fn log_dir(&self, test_id: &str) -> PathBuf {
        PathBuf::from(&self.paths.log_root).join(test_id)
    }
}

/// Reject baud rates the hardware allow-list does not cover.
pub fn validate_baud(baud: u32) -> Result<u32> {
    if ALLOWED_BAUD_RATES.contains(&baud) {
        Ok(baud)
    } else {
        Err(anyhow!(
            "baud rate {} not allowed (expected one of {:?})",
            baud,
            ALLOWED_BAUD_RATES
        ))
    }
}

/// Stream identifiers become path components; keep them boring.
pub fn validate_test_id(test_id: &str) -> Result<&str> {
    if test_id.is_empty() {
        return Err(anyhow!("test id must not be empty"));
    }
    if !test_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(anyhow!(
            "test id '{test_id}' contains characters outside [A-Za-z0-9._-]"
        ));
    }
    Ok(test_id)
}

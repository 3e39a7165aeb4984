//! # sertap - field-testbed serial observer
//!
//! sertap bridges an embedded device's serial line to (a) at most one TCP
//! client and (b) a durable, timestamped binary log. It is built for
//! unattended field testbeds: the serial link flaps, clients come and go,
//! and the one thing that must survive is the time-ordered record of every
//! byte that crossed the wire.
//!
//! ## Design rules
//!
//! - **Never block the fastest producer on the slowest consumer.** Both
//!   internal queues are bounded and lossy: under sustained overload the
//!   newest event is dropped and logged, and everything keeps moving.
//! - **Transient failures are not failures.** Serial open/read/write errors
//!   are retried forever with capped backoff; a client disconnect just
//!   returns the proxy to listening.
//! - **Bounded time to notice stop.** Every blocking call in every worker
//!   carries a timeout, so cooperative shutdown completes within known
//!   join windows.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use sertap::config::Config;
//! use sertap::supervisor::{self, StartOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_or_default("sertap.toml").await?;
//!     let options = StartOptions {
//!         test_id: "t42".to_string(),
//!         device: "/dev/ttyUSB0".to_string(),
//!         baud_rate: 115200,
//!         listen: Some(7777),
//!     };
//!     supervisor::run(config, options).await
//! }
//! ```
//!
//! ## Module organization
//!
//! - [`bridge`] - the three workers and their queues/stop flags
//! - [`device`] - serial channel and reconnect backoff
//! - [`event`] / [`record`] - in-memory model and on-disk codec
//! - [`supervisor`] - PID file, signals, startup and bounded shutdown
//! - [`config`] - TOML configuration and CLI-facing validation

pub mod bridge;
pub mod config;
pub mod device;
pub mod event;
pub mod logutil;
pub mod metrics;
pub mod record;
pub mod supervisor;

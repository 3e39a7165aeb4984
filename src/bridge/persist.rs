//! Persistence worker.
//!
//! Drains the persistence queue into rotating record files. The queue wait
//! is bounded by whatever remains of the current rotation interval, so a
//! quiet stream still rotates on time and the stop flag is re-checked at
//! least that often; the supervisor additionally pushes a wake sentinel at
//! shutdown so the worker never waits out a full interval before noticing.
//!
//! Files are named by their UTC creation time. A failed append is logged
//! and the event skipped; only the log directory being uncreatable (checked
//! by the supervisor before this worker starts) is fatal to the daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::bridge::{PersistItem, PersistReceiver, StopFlag};
use crate::event::Event;
use crate::metrics;
use crate::record::encode_record;

/// One open record file plus where it lives.
struct LogFile {
    file: tokio::fs::File,
    path: PathBuf,
}

impl LogFile {
    async fn create(dir: &Path) -> Result<Self> {
        let name = format!("{}.rec", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let path = dir.join(name);
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating record file {}", path.display()))?;
        info!("Opened record file {}", path.display());
        Ok(LogFile { file, path })
    }

    async fn append(&mut self, event: &Event) -> Result<()> {
        let encoded = encode_record(event);
        self.file
            .write_all(&encoded)
            .await
            .with_context(|| format!("appending record to {}", self.path.display()))?;
        self.file.flush().await?;
        Ok(())
    }

    async fn close(mut self) {
        if let Err(e) = self.file.flush().await {
            warn!("Flush on close of {} failed: {}", self.path.display(), e);
        }
        info!("Closed record file {}", self.path.display());
    }
}

pub struct PersistenceWorker {
    rx: PersistReceiver,
    dir: PathBuf,
    rotate_interval: Duration,
    stop: StopFlag,
}

impl PersistenceWorker {
    pub fn new(
        rx: PersistReceiver,
        dir: PathBuf,
        rotate_interval: Duration,
        stop: StopFlag,
    ) -> Self {
        PersistenceWorker {
            rx,
            dir,
            rotate_interval,
            stop,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Persistence worker starting in {} (rotation every {}s)",
            self.dir.display(),
            self.rotate_interval.as_secs()
        );

        let mut file = match LogFile::create(&self.dir).await {
            Ok(f) => Some(f),
            Err(e) => {
                error!("{:#}", e);
                None
            }
        };
        let mut next_rotation = Instant::now() + self.rotate_interval;

        loop {
            if self.stop.stop_requested() {
                break;
            }
            let remaining = next_rotation.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                // Rotation interval elapsed with nothing to write.
                Err(_) => {
                    if let Some(old) = file.take() {
                        old.close().await;
                    }
                    match LogFile::create(&self.dir).await {
                        Ok(f) => file = Some(f),
                        Err(e) => error!("{:#}", e),
                    }
                    next_rotation = Instant::now() + self.rotate_interval;
                }
                Ok(Some(PersistItem::Record(event))) => {
                    if file.is_none() {
                        match LogFile::create(&self.dir).await {
                            Ok(f) => file = Some(f),
                            Err(e) => error!("{:#}", e),
                        }
                    }
                    if let Some(f) = file.as_mut() {
                        match f.append(&event).await {
                            Ok(()) => metrics::inc_records_written(),
                            Err(e) => error!("Skipping record: {:#}", e),
                        }
                    }
                }
                // Shutdown sentinel; the stop check at the loop top decides.
                Ok(Some(PersistItem::Wake)) => {}
                // All producers dropped their senders.
                Ok(None) => break,
            }
        }

        // Drain whatever was already queued so an orderly shutdown does not
        // lose events that producers successfully enqueued.
        while let Ok(item) = self.rx.try_recv() {
            let event = match item {
                PersistItem::Record(event) => event,
                PersistItem::Wake => continue,
            };
            if let Some(f) = file.as_mut() {
                match f.append(&event).await {
                    Ok(()) => metrics::inc_records_written(),
                    Err(e) => error!("Skipping record: {:#}", e),
                }
            }
        }
        if let Some(f) = file.take() {
            f.close().await;
        }
        self.stop.mark_stopped();
        info!("Persistence worker stopped");
    }
}

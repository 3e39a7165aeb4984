//! Device reader worker.
//!
//! Owns the inbound half of the serial channel. Walks a small state machine
//! each iteration: closed → (re)open with backoff → open → read one line →
//! fan the event out to both queues. Transient serial failures are retried
//! forever; nothing on this path is fatal to the process.

use std::sync::Arc;

use log::{info, warn};

use crate::bridge::{offer_net, offer_persist, NetSender, PersistSender, StopFlag};
use crate::device::backoff::Backoff;
use crate::device::DeviceChannel;
use crate::event::{Direction, Event};
use crate::metrics;

pub struct DeviceReader {
    channel: Arc<DeviceChannel>,
    backoff: Backoff,
    net_tx: NetSender,
    persist_tx: PersistSender,
    stop: StopFlag,
}

impl DeviceReader {
    pub fn new(
        channel: Arc<DeviceChannel>,
        net_tx: NetSender,
        persist_tx: PersistSender,
        stop: StopFlag,
    ) -> Self {
        DeviceReader {
            channel,
            backoff: Backoff::default(),
            net_tx,
            persist_tx,
            stop,
        }
    }

    pub async fn run(mut self) {
        info!("Device reader starting on {}", self.channel.port_name());
        let mut opened_before = false;

        loop {
            if self.stop.stop_requested() {
                break;
            }

            if !self.channel.is_open() {
                match self.channel.open().await {
                    Ok(()) => {
                        self.backoff.reset();
                        if opened_before {
                            metrics::inc_serial_reopens();
                        }
                        opened_before = true;
                    }
                    Err(e) => {
                        let delay = self.backoff.delay_before_retry();
                        warn!("{}; retrying in {:.1}s", e, delay.as_secs_f64());
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            }

            // Blocks at most the port's read timeout; a read error closes
            // the channel internally and the next iteration re-opens it.
            match self.channel.read_line() {
                Some((line, timestamp)) => {
                    metrics::inc_device_lines_read();
                    let event = Event::at(Direction::ReadFromDevice, line, timestamp);
                    offer_net(&self.net_tx, event.clone());
                    offer_persist(&self.persist_tx, event);
                }
                None => {
                    // No complete line this round; let the runtime breathe
                    // before the next bounded read.
                    tokio::task::yield_now().await;
                }
            }
        }

        self.channel.close();
        self.stop.mark_stopped();
        info!("Device reader stopped");
    }
}

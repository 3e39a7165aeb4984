//! The serial/socket/persistence bridge.
//!
//! Three cooperating workers connected by two bounded queues:
//!
//! ```text
//! serial line ──▶ DeviceReader ──▶ network queue ──▶ NetworkProxy ◀──▶ TCP client
//!                      │                                   │
//!                      └────────▶ persistence queue ◀──────┘
//!                                        │
//!                                  PersistenceWorker ──▶ rotating record files
//! ```
//!
//! Both queues are bounded and producers only ever `try_send`: under
//! overload the newest event is dropped and logged rather than ever
//! blocking a producer on a slow consumer. Cancellation is cooperative —
//! each worker polls its [`StopFlag`] at least once per loop iteration and
//! reports back through the same flag when it has actually finished.

pub mod persist;
pub mod proxy;
pub mod reader;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::event::Event;
use crate::metrics;

const RUNNING: u8 = 0;
const STOP_REQUESTED: u8 = 1;
const STOPPED: u8 = 2;

/// Tri-state cooperative cancellation token.
///
/// The supervisor flips it to stop-requested; the owning worker observes
/// that within one loop iteration and flips it to stopped on exit, which is
/// what the supervisor's bounded join waits on.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicU8>);

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicU8::new(RUNNING)))
    }

    pub fn request_stop(&self) {
        // A worker that already reported stopped stays stopped.
        let _ = self
            .0
            .compare_exchange(RUNNING, STOP_REQUESTED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire) != RUNNING
    }

    pub fn mark_stopped(&self) {
        self.0.store(STOPPED, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) == STOPPED
    }

    /// Wait up to `limit` for the worker to report stopped.
    pub async fn wait_stopped(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while !self.stopped() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

/// An entry in the persistence queue: a real event, or a wake sentinel the
/// supervisor pushes at shutdown so the worker's bounded wait returns
/// promptly instead of running out the rotation timer.
#[derive(Debug)]
pub enum PersistItem {
    Record(Event),
    Wake,
}

pub type NetSender = mpsc::Sender<Event>;
pub type NetReceiver = mpsc::Receiver<Event>;
pub type PersistSender = mpsc::Sender<PersistItem>;
pub type PersistReceiver = mpsc::Receiver<PersistItem>;

pub fn net_queue(capacity: usize) -> (NetSender, NetReceiver) {
    // tokio panics on a zero-capacity bounded channel.
    mpsc::channel(capacity.max(1))
}

pub fn persist_queue(capacity: usize) -> (PersistSender, PersistReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Non-blocking enqueue toward the network proxy; full queue drops the event.
pub fn offer_net(tx: &NetSender, event: Event) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(ev)) => {
            metrics::inc_net_queue_drops();
            warn!(
                "Network queue full, dropping {} byte {} event",
                ev.payload.len(),
                ev.direction
            );
        }
        Err(TrySendError::Closed(_)) => debug!("Network queue closed, discarding event"),
    }
}

/// Non-blocking enqueue toward the persistence worker; full queue drops.
pub fn offer_persist(tx: &PersistSender, event: Event) {
    match tx.try_send(PersistItem::Record(event)) {
        Ok(()) => {}
        Err(TrySendError::Full(PersistItem::Record(ev))) => {
            metrics::inc_persist_queue_drops();
            warn!(
                "Persistence queue full, dropping {} byte {} event",
                ev.payload.len(),
                ev.direction
            );
        }
        Err(_) => debug!("Persistence queue closed, discarding event"),
    }
}

/// Unblock the persistence worker's queue wait. If the queue is full the
/// worker is not blocked on it anyway, so a failed send is fine.
pub fn wake_persist(tx: &PersistSender) {
    let _ = tx.try_send(PersistItem::Wake);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Direction;

    #[test]
    fn stop_flag_walks_through_states() {
        let flag = StopFlag::new();
        assert!(!flag.stop_requested());
        assert!(!flag.stopped());
        flag.request_stop();
        assert!(flag.stop_requested());
        assert!(!flag.stopped());
        flag.mark_stopped();
        assert!(flag.stopped());
        // Still reads as stop-requested for loop checks.
        assert!(flag.stop_requested());
    }

    #[tokio::test]
    async fn wait_stopped_times_out_then_succeeds() {
        let flag = StopFlag::new();
        assert!(!flag.wait_stopped(Duration::from_millis(60)).await);
        flag.mark_stopped();
        assert!(flag.wait_stopped(Duration::from_millis(60)).await);
    }

    #[tokio::test]
    async fn full_queue_drops_exactly_the_overflow() {
        let (tx, mut rx) = net_queue(4);
        for i in 0..5u8 {
            offer_net(&tx, Event::at(Direction::ReadFromDevice, vec![i], i as f64));
        }
        drop(tx);
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev.payload[0]);
        }
        // Five produced, four observed, order preserved, newest shed.
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}

//! Process-wide operational counters.
//!
//! Cheap relaxed atomics bumped from the hot paths; `snapshot()` is read by
//! tests and by the shutdown summary log line.

use std::sync::atomic::{AtomicU64, Ordering};

static DEVICE_LINES_READ: AtomicU64 = AtomicU64::new(0);
static CLIENT_BYTES_IN: AtomicU64 = AtomicU64::new(0);
static EVENTS_FORWARDED: AtomicU64 = AtomicU64::new(0);
static RECORDS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static NET_QUEUE_DROPS: AtomicU64 = AtomicU64::new(0);
static PERSIST_QUEUE_DROPS: AtomicU64 = AtomicU64::new(0);
static SERIAL_REOPENS: AtomicU64 = AtomicU64::new(0);
static CLIENT_SESSIONS: AtomicU64 = AtomicU64::new(0);

pub fn inc_device_lines_read() {
    DEVICE_LINES_READ.fetch_add(1, Ordering::Relaxed);
}
pub fn add_client_bytes_in(n: u64) {
    CLIENT_BYTES_IN.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_events_forwarded() {
    EVENTS_FORWARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_records_written() {
    RECORDS_WRITTEN.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_net_queue_drops() {
    NET_QUEUE_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_persist_queue_drops() {
    PERSIST_QUEUE_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_serial_reopens() {
    SERIAL_REOPENS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_client_sessions() {
    CLIENT_SESSIONS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub device_lines_read: u64,
    pub client_bytes_in: u64,
    pub events_forwarded: u64,
    pub records_written: u64,
    pub net_queue_drops: u64,
    pub persist_queue_drops: u64,
    pub serial_reopens: u64,
    pub client_sessions: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        device_lines_read: DEVICE_LINES_READ.load(Ordering::Relaxed),
        client_bytes_in: CLIENT_BYTES_IN.load(Ordering::Relaxed),
        events_forwarded: EVENTS_FORWARDED.load(Ordering::Relaxed),
        records_written: RECORDS_WRITTEN.load(Ordering::Relaxed),
        net_queue_drops: NET_QUEUE_DROPS.load(Ordering::Relaxed),
        persist_queue_drops: PERSIST_QUEUE_DROPS.load(Ordering::Relaxed),
        serial_reopens: SERIAL_REOPENS.load(Ordering::Relaxed),
        client_sessions: CLIENT_SESSIONS.load(Ordering::Relaxed),
    }
}

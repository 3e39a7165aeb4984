//! In-memory model of a unit of serial traffic.
//!
//! Every byte run that crosses the bridge becomes an [`Event`]: a direction
//! tag, the raw payload, and a wall-clock timestamp in fractional seconds
//! since the Unix epoch. Events are immutable once constructed; a producer
//! that feeds both queues enqueues a clone into each.

use std::time::{SystemTime, UNIX_EPOCH};

/// Origin of an event's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from the device's serial line.
    ReadFromDevice,
    /// Bytes a network client wrote through to the device.
    WrittenByClient,
}

impl Direction {
    /// On-disk encoding (record `direction` field).
    pub fn wire_value(self) -> i32 {
        match self {
            Direction::ReadFromDevice => 0,
            Direction::WrittenByClient => 1,
        }
    }

    /// Inverse of [`Direction::wire_value`].
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(Direction::ReadFromDevice),
            1 => Some(Direction::WrittenByClient),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ReadFromDevice => write!(f, "device"),
            Direction::WrittenByClient => write!(f, "client"),
        }
    }
}

/// A tagged, timestamped unit of serial traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub direction: Direction,
    pub payload: Vec<u8>,
    /// Seconds since the Unix epoch, microsecond-resolution.
    pub timestamp: f64,
}

impl Event {
    /// Build an event stamped with the current wall-clock time.
    pub fn now(direction: Direction, payload: Vec<u8>) -> Self {
        Self::at(direction, payload, epoch_now())
    }

    /// Build an event with an explicit timestamp.
    pub fn at(direction: Direction, payload: Vec<u8>, timestamp: f64) -> Self {
        Event {
            direction,
            payload,
            timestamp,
        }
    }

    /// Timestamp split into whole seconds and microseconds, as persisted.
    /// Microseconds are clamped to 0..=999_999 so a timestamp right at a
    /// second boundary never encodes an out-of-range fraction.
    pub fn timestamp_parts(&self) -> (i32, i32) {
        let secs = self.timestamp.trunc();
        let micros = ((self.timestamp - secs) * 1_000_000.0).round() as i64;
        (secs as i32, micros.clamp(0, 999_999) as i32)
    }
}

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Split a client-originated byte run into logical lines.
///
/// Splits on `\r`, `\n` or `\r\n` terminators and discards empty fragments,
/// so `b"AT\r\nOK\r\n"` yields `[b"AT", b"OK"]`. Trailing bytes without a
/// terminator still form a fragment.
pub fn split_client_lines(data: &[u8]) -> Vec<&[u8]> {
    data.split(|b| *b == b'\n' || *b == b'\r')
        .filter(|frag| !frag.is_empty())
        .collect()
}

/// Turn one socket read into per-line persistence events.
///
/// Each fragment is offset by `index` microseconds past `receive_time` so a
/// later sort-by-timestamp replay preserves the relative order of lines that
/// arrived in a single read.
pub fn client_write_events(data: &[u8], receive_time: f64) -> Vec<Event> {
    split_client_lines(data)
        .into_iter()
        .enumerate()
        .map(|(i, frag)| {
            Event::at(
                Direction::WrittenByClient,
                frag.to_vec(),
                receive_time + i as f64 * 1e-6,
            )
        })
        .collect()
}

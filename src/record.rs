//! On-disk record codec.
//!
//! An [`Event`](crate::event::Event) persists as a little-endian,
//! length-prefixed binary record with no inter-record separator:
//!
//! | field        | type   | meaning                                    |
//! |--------------|--------|--------------------------------------------|
//! | total_length | u32    | payload length + 12                        |
//! | direction    | i32    | 0 = read from device, 1 = written by client |
//! | ts_seconds   | i32    | whole seconds of the event timestamp       |
//! | ts_micros    | i32    | fractional part in microseconds (0..=999999) |
//! | payload      | bytes  | raw data                                   |
//!
//! Readers must frame by the length prefix, never by scanning for line
//! breaks: payloads routinely contain `\r`/`\n` bytes of their own.

use std::io::Read;

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, BytesMut};

use crate::event::{Direction, Event};

/// Fixed bytes of header following the length prefix.
pub const HEADER_LEN: usize = 12;

/// Upper bound on a record accepted from disk. A corrupt length prefix
/// would otherwise ask the reader to allocate up to 4 GiB for the body.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode one event as a framed record.
pub fn encode_record(event: &Event) -> BytesMut {
    let (secs, micros) = event.timestamp_parts();
    let mut buf = BytesMut::with_capacity(4 + HEADER_LEN + event.payload.len());
    buf.put_u32_le((event.payload.len() + HEADER_LEN) as u32);
    buf.put_i32_le(event.direction.wire_value());
    buf.put_i32_le(secs);
    buf.put_i32_le(micros);
    buf.put_slice(&event.payload);
    buf
}

/// Decode the body of a record (everything after the length prefix).
fn decode_body(mut body: &[u8]) -> Result<Event> {
    if body.len() < HEADER_LEN {
        bail!("record body truncated: {} bytes", body.len());
    }
    let direction_raw = body.get_i32_le();
    let direction = Direction::from_wire(direction_raw)
        .with_context(|| format!("unknown record direction {direction_raw}"))?;
    let secs = body.get_i32_le();
    let micros = body.get_i32_le();
    if !(0..=999_999).contains(&micros) {
        bail!("record microseconds out of range: {micros}");
    }
    let timestamp = secs as f64 + micros as f64 * 1e-6;
    Ok(Event::at(direction, body.to_vec(), timestamp))
}

/// Streaming reader over a sequence of appended records.
///
/// Frames strictly by the 4-byte length prefix. A clean end of input between
/// records yields `None`; anything shorter than a whole record is an error.
pub struct RecordReader<R: Read> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        RecordReader { inner }
    }

    /// Read the next record, or `None` at end of input.
    pub fn read_record(&mut self) -> Result<Option<Event>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            let n = self
                .inner
                .read(&mut len_buf[filled..])
                .context("reading record length prefix")?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!("truncated record: partial length prefix");
            }
            filled += n;
        }
        let total_length = u32::from_le_bytes(len_buf) as usize;
        if total_length < HEADER_LEN {
            bail!("record length {total_length} shorter than header");
        }
        if total_length > MAX_RECORD_LEN {
            bail!("record length {total_length} exceeds maximum {MAX_RECORD_LEN}");
        }
        let mut body = vec![0u8; total_length];
        self.inner
            .read_exact(&mut body)
            .context("reading record body")?;
        decode_body(&body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Direction;

    fn sample(direction: Direction, payload: &[u8], ts: f64) -> Event {
        Event::at(direction, payload.to_vec(), ts)
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let original = sample(Direction::WrittenByClient, b"AT+CSQ?", 1_700_000_123.456789);
        let encoded = encode_record(&original);
        let mut reader = RecordReader::new(&encoded[..]);
        let decoded = reader.read_record().unwrap().unwrap();
        assert_eq!(decoded.direction, original.direction);
        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.timestamp_parts(), original.timestamp_parts());
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn payload_with_embedded_newlines_frames_intact() {
        let payload = b"line1\r\nline2\nline3\r";
        let original = sample(Direction::ReadFromDevice, payload, 42.5);
        let encoded = encode_record(&original);
        let mut reader = RecordReader::new(&encoded[..]);
        let decoded = reader.read_record().unwrap().unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn consecutive_records_stream_in_order() {
        let mut buf = BytesMut::new();
        for (i, p) in [&b"X"[..], b"Y", b"Z"].iter().enumerate() {
            buf.extend_from_slice(&encode_record(&sample(
                Direction::ReadFromDevice,
                p,
                100.0 + i as f64,
            )));
        }
        let mut reader = RecordReader::new(&buf[..]);
        let mut payloads = Vec::new();
        while let Some(ev) = reader.read_record().unwrap() {
            payloads.push(ev.payload);
        }
        assert_eq!(payloads, vec![b"X".to_vec(), b"Y".to_vec(), b"Z".to_vec()]);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let encoded = encode_record(&sample(Direction::ReadFromDevice, b"hello", 1.0));
        let cut = &encoded[..encoded.len() - 2];
        let mut reader = RecordReader::new(cut);
        assert!(reader.read_record().is_err());
    }

    #[test]
    fn empty_payload_round_trips() {
        let original = sample(Direction::ReadFromDevice, b"", 0.000001);
        let encoded = encode_record(&original);
        assert_eq!(encoded.len(), 4 + HEADER_LEN);
        let mut reader = RecordReader::new(&encoded[..]);
        let decoded = reader.read_record().unwrap().unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.timestamp_parts(), (0, 1));
    }

    #[test]
    fn corrupt_length_prefix_rejected() {
        // A damaged file whose prefix claims a 4 GiB record must error out
        // instead of attempting the allocation.
        let mut bytes = u32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"garbage");
        let mut reader = RecordReader::new(&bytes[..]);
        assert!(reader.read_record().is_err());
    }

    #[test]
    fn unknown_direction_rejected() {
        let mut encoded = encode_record(&sample(Direction::ReadFromDevice, b"x", 1.0));
        encoded[4] = 9; // direction field, little-endian low byte
        let mut reader = RecordReader::new(&encoded[..]);
        assert!(reader.read_record().is_err());
    }
}

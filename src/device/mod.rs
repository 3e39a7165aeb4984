//! Serial device channel.
//!
//! [`DeviceChannel`] owns the physical serial connection. It is shared
//! behind an `Arc` between the device reader (inbound lines) and the network
//! proxy (outbound client writes); each side's access is serialized by its
//! own single-threaded loop, with a mutex guarding the handle itself.
//!
//! State changes are observable only through log lines: workers discover the
//! channel's state by calling [`DeviceChannel::is_open`], never by callback.
//! A failed write closes the channel as a side effect so the next
//! `is_open()` check reflects reality and the reader re-enters its reconnect
//! path.

pub mod backoff;

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info, warn};
use serialport::SerialPort;
use thiserror::Error;

use crate::event::epoch_now;

/// Read timeout on the underlying port. Bounds how long `read_line` can
/// block its caller; "no data yet" is a normal condition, not a failure.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
    #[error("serial port is not open")]
    NotOpen,
    #[error("serial write failed: {0}")]
    Write(std::io::Error),
}

struct Inner {
    port: Option<Box<dyn SerialPort>>,
    /// Bytes received after the last complete line.
    pending: Vec<u8>,
}

/// The bridge's handle on the device's serial line.
pub struct DeviceChannel {
    port_name: String,
    baud_rate: u32,
    inner: Mutex<Inner>,
}

impl DeviceChannel {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        DeviceChannel {
            port_name: port_name.to_string(),
            baud_rate,
            inner: Mutex::new(Inner {
                port: None,
                pending: Vec::new(),
            }),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the serial port. A no-op when already open.
    pub async fn open(&self) -> Result<(), DeviceError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.port.is_some() {
                return Ok(());
            }
        }

        let mut builder =
            serialport::new(&self.port_name, self.baud_rate).timeout(READ_TIMEOUT);
        // Some USB serial adapters need explicit settings
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| DeviceError::Open {
            port: self.port_name.clone(),
            source: e,
        })?;

        // Toggle DTR/RTS so ESP32-style boards wake up, then drop whatever
        // startup text was already buffered.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut purge_buf = [0u8; 512];
        if let Ok(available) = port.bytes_to_read() {
            if available > 0 {
                let _ = port.read(&mut purge_buf);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
        inner.port = Some(port);
        info!(
            "Opened serial port {} at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(())
    }

    /// Close the serial port. A no-op when already closed.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.port.take().is_some() {
            inner.pending.clear();
            info!("Closed serial port {}", self.port_name);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().port.is_some()
    }

    /// Read one complete line from the device.
    ///
    /// Returns the line with its terminator stripped plus the wall-clock
    /// time it completed, or `None` when no full line arrived within the
    /// port's read timeout. Unexpected I/O errors close the channel and
    /// also yield `None`; the reader notices via `is_open()`.
    pub fn read_line(&self) -> Option<(Vec<u8>, f64)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(line) = take_line(&mut inner.pending) {
            return Some((line, epoch_now()));
        }

        let mut buf = [0u8; 512];
        let read = match inner.port.as_mut() {
            Some(port) => port.read(&mut buf),
            None => return None,
        };
        match read {
            Ok(n) if n > 0 => {
                inner.pending.extend_from_slice(&buf[..n]);
                take_line(&mut inner.pending).map(|line| (line, epoch_now()))
            }
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => None,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => None,
            Err(e) => {
                error!("Serial read failed on {}: {}", self.port_name, e);
                inner.port = None;
                inner.pending.clear();
                None
            }
        }
    }

    /// Write bytes to the device.
    ///
    /// A failure (device unplugged, port gone) closes the channel so the
    /// caller's next `is_open()` check reflects reality.
    pub fn write(&self, data: &[u8]) -> Result<usize, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        let port = inner.port.as_mut().ok_or(DeviceError::NotOpen)?;
        match port.write_all(data).and_then(|_| port.flush()) {
            Ok(()) => {
                debug!("Wrote {} bytes to {}", data.len(), self.port_name);
                Ok(data.len())
            }
            Err(e) => {
                warn!(
                    "Serial write failed on {}, closing channel: {}",
                    self.port_name, e
                );
                inner.port = None;
                inner.pending.clear();
                Err(DeviceError::Write(e))
            }
        }
    }
}

/// Pop the first complete line out of `pending`, stripping `\r\n`/`\n`.
fn take_line(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = pending.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = pending.drain(..=pos).collect();
    line.pop(); // the \n itself
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::take_line;

    #[test]
    fn take_line_strips_terminators() {
        let mut pending = b"OK\r\nERROR\npartial".to_vec();
        assert_eq!(take_line(&mut pending), Some(b"OK".to_vec()));
        assert_eq!(take_line(&mut pending), Some(b"ERROR".to_vec()));
        assert_eq!(take_line(&mut pending), None);
        assert_eq!(pending, b"partial");
    }

    #[test]
    fn take_line_keeps_interior_carriage_returns() {
        let mut pending = b"a\rb\n".to_vec();
        assert_eq!(take_line(&mut pending), Some(b"a\rb".to_vec()));
    }

    #[test]
    fn empty_line_yields_empty_payload() {
        let mut pending = b"\n".to_vec();
        assert_eq!(take_line(&mut pending), Some(Vec::new()));
    }
}

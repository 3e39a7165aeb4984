//! Network proxy worker.
//!
//! Serves at most one TCP client at a time. While a client is connected the
//! loop multiplexes three readiness sources: the network queue (device data
//! to forward), the client socket (bytes to write through to the device),
//! and a one-second tick that bounds how long a quiet connection can delay
//! the stop-flag check. While no client is connected only the listener and
//! the tick are polled, so device events accumulate in the bounded network
//! queue and are forwarded (oldest first) to the next client.
//!
//! Socket-level failures end the current session and return the proxy to
//! listening; they never terminate the worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::bridge::{offer_persist, NetReceiver, PersistSender, StopFlag};
use crate::device::DeviceChannel;
use crate::event::{client_write_events, epoch_now};
use crate::logutil::escape_log;
use crate::metrics;

/// Bound on one send to the client. A peer that has stopped reading fills
/// both socket buffers, and an unbounded send would then pend this worker's
/// select arm forever, taking the tick and the stop check down with it.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub struct NetworkProxy {
    listener: TcpListener,
    channel: Arc<DeviceChannel>,
    net_rx: NetReceiver,
    persist_tx: PersistSender,
    stop: StopFlag,
    client: Option<(TcpStream, SocketAddr)>,
    net_queue_open: bool,
}

impl NetworkProxy {
    /// The listener is bound by the supervisor before any worker starts, so
    /// a bind failure is a fatal startup error rather than a worker error.
    pub fn new(
        listener: TcpListener,
        channel: Arc<DeviceChannel>,
        net_rx: NetReceiver,
        persist_tx: PersistSender,
        stop: StopFlag,
    ) -> Self {
        NetworkProxy {
            listener,
            channel,
            net_rx,
            persist_tx,
            stop,
            client: None,
            net_queue_open: true,
        }
    }

    pub async fn run(mut self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Network proxy listening on {}", addr),
            Err(_) => info!("Network proxy listening"),
        }
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.stop.stop_requested() {
                break;
            }
            if self.client.is_some() {
                self.serve_client(&mut tick).await;
            } else {
                self.wait_for_client(&mut tick).await;
            }
        }

        if let Some((_, peer)) = self.client.take() {
            info!("Dropping client {} for shutdown", peer);
        }
        self.stop.mark_stopped();
        info!("Network proxy stopped");
    }

    /// Listening state: accept one client, or tick through for a stop check.
    async fn wait_for_client(&mut self, tick: &mut tokio::time::Interval) {
        tokio::select! {
            _ = tick.tick() => {}
            accepted = self.listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Client connected from {}", peer);
                    metrics::inc_client_sessions();
                    self.client = Some((stream, peer));
                }
                Err(e) => {
                    // Accept errors are transient (EMFILE, aborted handshake)
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Connected state: one multiplexed iteration.
    async fn serve_client(&mut self, tick: &mut tokio::time::Interval) {
        let mut buf = [0u8; 2048];
        let mut disconnect = false;
        let peer = {
            let (stream, peer) = match self.client.as_mut() {
                Some(session) => session,
                None => return,
            };
            let peer = *peer;

            tokio::select! {
                _ = tick.tick() => {}

                // Device data ready to forward to the client.
                maybe_event = self.net_rx.recv(), if self.net_queue_open => {
                    match maybe_event {
                        Some(event) => {
                            // One bounded, non-retrying send; a timeout,
                            // error or short write all mean the client is
                            // not keeping up and loses the session.
                            let sent =
                                tokio::time::timeout(SEND_TIMEOUT, stream.write(&event.payload))
                                    .await;
                            match sent {
                                Ok(Ok(n)) if n == event.payload.len() => {
                                    metrics::inc_events_forwarded();
                                }
                                Ok(Ok(n)) => {
                                    warn!(
                                        "Short send to client {} ({} of {} bytes)",
                                        peer,
                                        n,
                                        event.payload.len()
                                    );
                                    disconnect = true;
                                }
                                Ok(Err(e)) => {
                                    warn!("Send to client {} failed: {}", peer, e);
                                    disconnect = true;
                                }
                                Err(_) => {
                                    warn!("Send to client {} timed out", peer);
                                    disconnect = true;
                                }
                            }
                        }
                        None => {
                            // Reader gone; keep serving client-to-device
                            // traffic without spinning on the closed queue.
                            self.net_queue_open = false;
                        }
                    }
                }

                // Client bytes to write through to the device.
                result = stream.read(&mut buf) => match result {
                    Ok(0) => {
                        info!("Client {} disconnected", peer);
                        disconnect = true;
                    }
                    Ok(n) => {
                        forward_client_bytes(
                            &self.channel,
                            &self.persist_tx,
                            &buf[..n],
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!("Client {} socket error: {}", peer, e);
                        disconnect = true;
                    }
                }
            }
            peer
        };

        if disconnect {
            debug!("Returning to listening state after {}", peer);
            self.client = None;
        }
    }
}

/// Write one socket read through to the device and log it for persistence.
///
/// The device channel is opened on demand: a client may start talking before
/// the reader has (re)established the serial link. Each line fragment gets a
/// strictly increasing microsecond offset past the receive time so replay by
/// timestamp preserves intra-read ordering.
async fn forward_client_bytes(
    channel: &DeviceChannel,
    persist_tx: &PersistSender,
    data: &[u8],
) {
    let receive_time = epoch_now();
    metrics::add_client_bytes_in(data.len() as u64);
    debug!("Client wrote {} bytes: {}", data.len(), escape_log(data));

    if !channel.is_open() {
        if let Err(e) = channel.open().await {
            warn!("Cannot open device for client write: {}", e);
        }
    }
    if channel.is_open() {
        if let Err(e) = channel.write(data) {
            warn!("Write-through to device failed: {}", e);
        }
    }

    for event in client_write_events(data, receive_time) {
        offer_persist(persist_tx, event);
    }
}

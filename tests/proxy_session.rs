//! Network proxy behavior over real sockets: device→client forwarding,
//! client→persistence fragment ordering, and session turnover.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use sertap::bridge::proxy::NetworkProxy;
use sertap::bridge::{net_queue, offer_net, persist_queue, PersistItem, StopFlag};
use sertap::device::DeviceChannel;
use sertap::event::{Direction, Event};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: std::net::SocketAddr,
    net_tx: sertap::bridge::NetSender,
    persist_rx: sertap::bridge::PersistReceiver,
    stop: StopFlag,
}

async fn start_proxy() -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    // Points at a device that does not exist; open attempts fail fast and
    // the proxy still persists client traffic.
    let channel = Arc::new(DeviceChannel::new("/dev/sertap-test-missing", 115200));
    let (net_tx, net_rx) = net_queue(32);
    let (persist_tx, persist_rx) = persist_queue(32);
    let stop = StopFlag::new();
    let proxy = NetworkProxy::new(listener, channel, net_rx, persist_tx, stop.clone());
    tokio::spawn(proxy.run());
    Harness {
        addr,
        net_tx,
        persist_rx,
        stop,
    }
}

async fn next_persisted(harness: &mut Harness) -> Event {
    loop {
        match timeout(WAIT, harness.persist_rx.recv())
            .await
            .expect("persist item in time")
            .expect("queue open")
        {
            PersistItem::Record(event) => return event,
            PersistItem::Wake => continue,
        }
    }
}

#[tokio::test]
async fn device_events_forward_to_connected_client() {
    let harness = start_proxy().await;
    let mut client = TcpStream::connect(harness.addr).await.expect("connect");
    // Give the accept arm a moment to fire.
    tokio::time::sleep(Duration::from_millis(100)).await;

    offer_net(
        &harness.net_tx,
        Event::at(Direction::ReadFromDevice, b"+CSQ: 23,0\r\n".to_vec(), 1.0),
    );

    let mut buf = [0u8; 64];
    let n = timeout(WAIT, client.read(&mut buf))
        .await
        .expect("client data in time")
        .expect("read");
    assert_eq!(&buf[..n], b"+CSQ: 23,0\r\n");

    harness.stop.request_stop();
    assert!(harness.stop.wait_stopped(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn client_write_yields_ordered_fragments() {
    let mut harness = start_proxy().await;
    let mut client = TcpStream::connect(harness.addr).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.write_all(b"AT\r\nOK\r\n").await.expect("write");

    let first = next_persisted(&mut harness).await;
    let second = next_persisted(&mut harness).await;
    assert_eq!(first.direction, Direction::WrittenByClient);
    assert_eq!(second.direction, Direction::WrittenByClient);
    assert_eq!(first.payload, b"AT");
    assert_eq!(second.payload, b"OK");

    let (s1, u1) = first.timestamp_parts();
    let (s2, u2) = second.timestamp_parts();
    let micros1 = s1 as i64 * 1_000_000 + u1 as i64;
    let micros2 = s2 as i64 * 1_000_000 + u2 as i64;
    assert_eq!(
        micros2 - micros1,
        1,
        "fragments are exactly one microsecond apart"
    );

    harness.stop.request_stop();
    assert!(harness.stop.wait_stopped(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn stalled_client_does_not_block_stop() {
    let harness = start_proxy().await;
    // This client never reads; once both socket buffers fill, sends to it
    // can no longer complete. Payloads are large enough that a few of them
    // wedge any default buffer size.
    let client = TcpStream::connect(harness.addr).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..32u32 {
        offer_net(
            &harness.net_tx,
            Event::at(Direction::ReadFromDevice, vec![0x55; 1 << 20], i as f64),
        );
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.stop.request_stop();
    assert!(
        harness.stop.wait_stopped(WAIT).await,
        "proxy must observe stop while a client is wedged"
    );
    drop(client);
}

#[tokio::test]
async fn disconnect_returns_proxy_to_listening() {
    let mut harness = start_proxy().await;

    let mut first = TcpStream::connect(harness.addr).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.write_all(b"one\n").await.expect("write");
    assert_eq!(next_persisted(&mut harness).await.payload, b"one");

    // Peer close is an empty read; the proxy must accept a new session.
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second = TcpStream::connect(harness.addr).await.expect("reconnect");
    tokio::time::sleep(Duration::from_millis(200)).await;
    second.write_all(b"two\n").await.expect("write");
    assert_eq!(next_persisted(&mut harness).await.payload, b"two");

    harness.stop.request_stop();
    assert!(harness.stop.wait_stopped(Duration::from_secs(10)).await);
}

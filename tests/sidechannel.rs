use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use codec::{AddressKey, SidechannelRecord, TimePoint, UdpPacket};
use probed::sidechannel::{run_listener, run_worker, InboundRegistry};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A worker dialing a listener completes the hello handshake and the
/// scheduler's hello channel is notified, without any time report having
/// been pushed yet.
#[tokio::test]
async fn worker_handshake_opens_the_hello_gate() -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let dst: SocketAddr = listener.local_addr()?;

    let registry = InboundRegistry::new();
    tokio::spawn(run_listener(listener, registry));

    let (report_tx, _report_rx) = mpsc::unbounded_channel();
    let (hello_tx, mut hello_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(dst, report_tx, hello_tx));

    let addr = tokio::time::timeout(Duration::from_secs(2), hello_rx.recv())
        .await?
        .expect("hello channel stays open");
    assert_eq!(addr, AddressKey::from_ip(dst.ip()));

    Ok(())
}

/// Once a worker has connected, a time report pushed into the listener's
/// registry for that peer's address is delivered back out through the
/// worker's own record channel.
#[tokio::test]
async fn pushed_time_report_reaches_the_connected_worker() -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let dst: SocketAddr = listener.local_addr()?;

    let registry = InboundRegistry::new();
    let registry_for_listener = registry.clone();
    tokio::spawn(run_listener(listener, registry_for_listener));

    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let (hello_tx, mut hello_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(dst, report_tx, hello_tx));

    let peer_addr = tokio::time::timeout(Duration::from_secs(2), hello_rx.recv())
        .await?
        .expect("hello channel stays open");

    let record = SidechannelRecord {
        addr: peer_addr,
        payload: UdpPacket::time_report(7, 3, TimePoint::new(10, 0), TimePoint::new(10, 50)),
        observed_at: TimePoint::new(10, 60),
    };
    registry.push(peer_addr, record);

    let received = tokio::time::timeout(Duration::from_secs(2), report_rx.recv())
        .await?
        .expect("record delivered to the dialing worker");
    assert_eq!(received, record);

    Ok(())
}

//! The TCP side-channel: each peer we PING is also a TCP server we dial, to
//! read back the authoritative T2/T3 timestamps it observed for our PINGs.
//! Symmetrically, any peer that PINGs us dials our TCP listener, and we
//! stream our own T2/T3 observations back out over that connection as we
//! make them.
//!
//! Isolating each destination address's connection in its own task mirrors
//! the original `client_fork()`: one independent reconnect loop per peer,
//! so one flaky peer can never block delivery to another.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use codec::{AddressKey, SidechannelRecord, RECORD_LEN};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// How long a worker waits for inbound records before assuming the peer has
/// gone away and reconnecting. The original's own doc comment calls this
/// value "bad" but keeps it; we keep it too rather than invent a new
/// timeout the original never validated.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Outbound half of the side channel: dials `dst`, decodes fixed-size
/// [`SidechannelRecord`]s, and forwards them to the scheduler. Once the
/// handshake completes, `connected_tx` is notified so the scheduler can
/// open the hello gate on every session pointed at this address — we have
/// nothing to correlate PINGs with until this connection exists.
pub async fn run_worker(
    dst: SocketAddr,
    tx: mpsc::UnboundedSender<SidechannelRecord>,
    connected_tx: mpsc::UnboundedSender<AddressKey>,
) {
    loop {
        let mut stream = match TcpStream::connect(dst).await {
            Ok(stream) => stream,
            Err(source) => {
                log::warn!("{}", WorkerError::Connect { addr: dst, source });
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                continue;
            }
        };
        log::info!("side-channel: connected to {dst}");

        let hello = SidechannelRecord {
            addr: AddressKey::from_ip(dst.ip()),
            payload: codec::UdpPacket::hello(),
            observed_at: codec::TimePoint::ZERO,
        };
        if stream.write_all(&hello.encode()).await.is_err() {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        let _ = connected_tx.send(AddressKey::from_ip(dst.ip()));

        if let Err(err) = stream_records(stream, &tx).await {
            log::warn!("side-channel: {dst} connection lost: {err}");
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn stream_records(mut stream: TcpStream, tx: &mpsc::UnboundedSender<SidechannelRecord>) -> std::io::Result<()> {
    let mut buf = [0u8; RECORD_LEN];
    loop {
        let read = tokio::time::timeout(IDLE_TIMEOUT, stream.read_exact(&mut buf)).await;
        let read = match read {
            Ok(result) => result,
            Err(_elapsed) => {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "side-channel idle timeout"));
            }
        };

        match read {
            Ok(0) => return Ok(()),
            Ok(_) => {
                if let Ok(record) = SidechannelRecord::decode(&buf) {
                    let _ = tx.send(record);
                } else {
                    log::warn!("side-channel: dropped malformed record");
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Registry of accepted inbound connections, keyed by the peer's address.
/// The scheduler pushes a record for an address; if no connection from that
/// address exists yet, the record is dropped (the peer has nothing to learn
/// the T2/T3 for a PING it never sent).
#[derive(Clone, Default)]
pub struct InboundRegistry {
    senders: Arc<Mutex<HashMap<AddressKey, mpsc::UnboundedSender<SidechannelRecord>>>>,
}

impl InboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, addr: AddressKey, record: SidechannelRecord) {
        let senders = self.senders.lock();
        if let Some(sender) = senders.get(&addr) {
            let _ = sender.send(record);
        }
    }

    fn register(&self, addr: AddressKey, sender: mpsc::UnboundedSender<SidechannelRecord>) {
        self.senders.lock().insert(addr, sender);
    }

    fn unregister(&self, addr: AddressKey) {
        self.senders.lock().remove(&addr);
    }
}

/// Accepts inbound side-channel connections and relays outgoing
/// [`SidechannelRecord`]s from [`InboundRegistry::push`] onto the matching
/// socket.
pub async fn run_listener(listener: TcpListener, registry: InboundRegistry) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("side-channel: accept failed: {err}");
                continue;
            }
        };

        let addr = AddressKey::from_ip(peer.ip());
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        registry.register(addr, record_tx);
        let registry = registry.clone();

        tokio::spawn(async move {
            serve_connection(stream, record_rx).await;
            registry.unregister(addr);
        });
    }
}

async fn serve_connection(mut stream: TcpStream, mut rx: mpsc::UnboundedReceiver<SidechannelRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(err) = stream.write_all(&record.encode()).await {
            log::warn!("side-channel: write failed: {err}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{TimePoint, UdpPacket};
    use std::net::Ipv4Addr;

    fn record() -> SidechannelRecord {
        SidechannelRecord {
            addr: AddressKey::from_ip(std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            payload: UdpPacket::time_report(1, 1, TimePoint::new(1, 0), TimePoint::new(1, 5)),
            observed_at: TimePoint::new(1, 10),
        }
    }

    #[test]
    fn push_without_a_registered_connection_is_a_silent_noop() {
        let registry = InboundRegistry::new();
        registry.push(AddressKey::from_ip(std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), record());
    }

    #[tokio::test]
    async fn push_after_register_delivers_to_that_address_only() {
        let registry = InboundRegistry::new();
        let a = AddressKey::from_ip(std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let b = AddressKey::from_ip(std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(a, tx);

        registry.push(b, record());
        registry.push(a, record());

        let received = rx.recv().await.expect("record delivered to a");
        assert_eq!(received, record());
        assert!(rx.try_recv().is_err());
    }
}

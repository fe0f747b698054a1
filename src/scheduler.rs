//! The main loop: one task drives PING pacing, PONG/PING dispatch, and
//! time-report correlation, no matter the configured [`crate::config::Mode`].
//! Whether anything gets PINGed at all is entirely a function of which
//! sessions are in the [`SessionTable`] — server mode simply starts with
//! none, matching the original's single `loop_or_die()` used by all three
//! modes.
//!
//! The UDP socket is driven from two `spawn_blocking` tasks (recv and send)
//! rather than an async socket, since T1/T4 capture goes through blocking
//! `recvmsg`/`sendmsg` calls to read the `SCM_TIMESTAMPING` control message.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use codec::{AddressKey, Dscp, PacketKind, SidechannelRecord, TimePoint, UdpPacket, PAYLOAD_LEN};
use session::{ProbeId, ResultTable, SequenceNumber, SessionTable};

use crate::config::{Config, Mode};
use crate::reporter::Reporter;
use crate::sidechannel::{self, InboundRegistry};
use crate::timestamper::Timestamper;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("failed to create {proto} socket: {source}")]
    Create {
        proto: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {proto} socket to {addr}: {source}")]
    Bind {
        proto: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on TCP socket: {0}")]
    Listen(#[source] io::Error),
}

enum UdpEvent {
    Received {
        bytes: Vec<u8>,
        from: SocketAddr,
        ts: TimePoint,
        dscp: Option<Dscp>,
    },
    Sent {
        addr: AddressKey,
        probe_id: ProbeId,
        seq: SequenceNumber,
        dscp: Dscp,
        t1: TimePoint,
    },
}

enum UdpCommand {
    SendPing {
        addr: AddressKey,
        dst: SocketAddr,
        probe_id: ProbeId,
        seq: SequenceNumber,
        dscp: Dscp,
        data: [u8; PAYLOAD_LEN],
    },
    SendPong {
        dst: SocketAddr,
        dscp: Dscp,
        data: [u8; PAYLOAD_LEN],
    },
}

/// Binds the dual-stack UDP and TCP sockets on `port`, matching the
/// original `bind_or_die`: `IPV6_V6ONLY` disabled so IPv4 peers are reached
/// through the same socket, `SO_REUSEADDR` on the TCP listener, backlog 10.
fn bind_sockets(config: &Config) -> Result<(Socket, Socket), BindError> {
    let addr = config.bind_addr();

    let udp = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| BindError::Create {
        proto: "UDP",
        source,
    })?;
    udp.set_only_v6(false).map_err(|source| BindError::Bind { proto: "UDP", addr, source })?;
    udp.bind(&addr.into()).map_err(|source| BindError::Bind { proto: "UDP", addr, source })?;

    let tcp = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)).map_err(|source| BindError::Create {
        proto: "TCP",
        source,
    })?;
    tcp.set_only_v6(false).map_err(|source| BindError::Bind { proto: "TCP", addr, source })?;
    tcp.set_reuse_address(true).map_err(|source| BindError::Bind { proto: "TCP", addr, source })?;
    tcp.bind(&addr.into()).map_err(|source| BindError::Bind { proto: "TCP", addr, source })?;
    tcp.listen(10).map_err(BindError::Listen)?;
    tcp.set_nonblocking(true).map_err(BindError::Listen)?;

    Ok((udp, tcp))
}

fn build_session_table(config: &Config) -> SessionTable {
    use session::MeasurementSession;

    let mut table = SessionTable::new();
    match config.mode {
        Mode::Client => {
            let dst = config.client_dst.expect("client mode requires a destination");
            table.add(MeasurementSession::new(
                0,
                dst,
                Duration::from_micros(config.client_interval_micros),
                config.client_dscp,
            ));
        }
        Mode::Server => {}
        Mode::Daemon => sessions_from_specs(&mut table, &config.sessions),
    }
    table
}

fn sessions_from_specs(table: &mut SessionTable, specs: &[crate::config::SessionSpec]) {
    use session::MeasurementSession;

    for spec in specs {
        table.add(MeasurementSession::new(
            spec.id,
            spec.dst,
            Duration::from_micros(spec.interval_micros),
            Dscp::new(spec.dscp),
        ));
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let (udp_sock, tcp_sock) = bind_sockets(&config)?;
    let timestamper = Arc::new(Timestamper::new(udp_sock, config.timestamp_mode, &config.interface)?);

    let tcp_std: std::net::TcpListener = tcp_sock.into();
    let tcp_listener = TcpListener::from_std(tcp_std)?;

    let mut sessions = build_session_table(&config);
    let mut results = ResultTable::new();
    let probe_timeout = Duration::from_micros(config.probe_timeout_micros);
    let reporter = Reporter::new(config.pipe_path.clone())?;

    let (udp_event_tx, mut udp_event_rx) = mpsc::unbounded_channel::<UdpEvent>();
    let (udp_cmd_tx, udp_cmd_rx) = mpsc::unbounded_channel::<UdpCommand>();

    spawn_udp_recv_loop(timestamper.clone(), udp_event_tx.clone());
    spawn_udp_send_loop(timestamper, udp_cmd_rx, udp_event_tx);

    let registry = InboundRegistry::new();
    tokio::spawn(sidechannel::run_listener(tcp_listener, registry.clone()));

    let (report_tx, mut report_rx) = mpsc::unbounded_channel::<SidechannelRecord>();
    let (hello_tx, mut hello_rx) = mpsc::unbounded_channel::<AddressKey>();
    let mut workers: HashMap<AddressKey, JoinHandle<()>> = HashMap::new();
    spawn_missing_workers(&sessions, &mut workers, &report_tx, &hello_tx);

    let mut tick = tokio::time::interval(Duration::from_millis(10));
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            Some(event) = udp_event_rx.recv() => {
                handle_udp_event(event, &udp_cmd_tx, &registry, &mut results, &reporter);
            }
            Some(record) = report_rx.recv() => {
                if record.payload.kind == PacketKind::TimeReport {
                    let finished = results.record_time_report(
                        record.addr,
                        record.payload.probe_id,
                        record.payload.seq,
                        record.payload.t2,
                        record.payload.t3,
                    );
                    if let Some(finished) = finished {
                        reporter.report(finished);
                    }
                }
            }
            Some(addr) = hello_rx.recv() => {
                sessions.mark_hello_received(addr);
            }
            _ = tick.tick() => {
                let now = Instant::now();
                emit_due_sessions(&mut sessions, &udp_cmd_tx, now);
                for finished in results.sweep_timeouts(now, probe_timeout) {
                    reporter.report(finished);
                }
                spawn_missing_workers(&sessions, &mut workers, &report_tx, &hello_tx);
            }
            _ = sighup.recv() => {
                if config.mode != Mode::Daemon {
                    log::info!("SIGHUP ignored: only daemon mode's session table is reloadable");
                    continue;
                }
                log::info!("SIGHUP received, reloading configuration");
                match config.reload_sessions() {
                    Ok(specs) => {
                        for (_, handle) in workers.drain() {
                            handle.abort();
                        }
                        results.clear();
                        let mut fresh = SessionTable::new();
                        sessions_from_specs(&mut fresh, &specs);
                        sessions = fresh;
                        spawn_missing_workers(&sessions, &mut workers, &report_tx, &hello_tx);
                        log::info!("reload complete: {} session(s)", sessions.iter().count());
                    }
                    Err(err) => log::error!("reload failed, keeping previous configuration: {err}"),
                }
            }
        }
    }
}

fn spawn_udp_recv_loop(timestamper: Arc<Timestamper>, tx: mpsc::UnboundedSender<UdpEvent>) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 512];
        loop {
            match timestamper.recv(&mut buf) {
                Ok((n, from, ts, dscp)) => {
                    let _ = tx.send(UdpEvent::Received {
                        bytes: buf[..n].to_vec(),
                        from,
                        ts,
                        dscp,
                    });
                }
                Err(err) => log::warn!("udp recv failed: {err}"),
            }
        }
    });
}

fn spawn_udp_send_loop(timestamper: Arc<Timestamper>, mut rx: mpsc::UnboundedReceiver<UdpCommand>, tx: mpsc::UnboundedSender<UdpEvent>) {
    tokio::task::spawn_blocking(move || {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                UdpCommand::SendPing { addr, dst, probe_id, seq, dscp, data } => {
                    if let Err(err) = timestamper.set_dscp(dst, dscp) {
                        log::warn!("failed to set DSCP for {dst}: {err}");
                    }
                    match timestamper.send(dst, &data) {
                        Ok(t1) => {
                            let _ = tx.send(UdpEvent::Sent { addr, probe_id, seq, dscp, t1 });
                        }
                        Err(err) => log::warn!("udp send to {dst} failed: {err}"),
                    }
                }
                UdpCommand::SendPong { dst, dscp, data } => {
                    if let Err(err) = timestamper.set_dscp(dst, dscp) {
                        log::warn!("failed to set DSCP for {dst}: {err}");
                    }
                    if let Err(err) = timestamper.send(dst, &data) {
                        log::warn!("udp send to {dst} failed: {err}");
                    }
                }
            }
        }
    });
}

fn spawn_missing_workers(
    sessions: &SessionTable,
    workers: &mut HashMap<AddressKey, JoinHandle<()>>,
    report_tx: &mpsc::UnboundedSender<SidechannelRecord>,
    hello_tx: &mpsc::UnboundedSender<AddressKey>,
) {
    for addr in sessions.addresses() {
        if let std::collections::hash_map::Entry::Vacant(entry) = workers.entry(addr) {
            let dst = sessions
                .iter()
                .find(|s| s.address_key() == addr)
                .map(|s| s.dst)
                .expect("address came from this table's own sessions");
            entry.insert(tokio::spawn(sidechannel::run_worker(dst, report_tx.clone(), hello_tx.clone())));
        }
    }
}

fn emit_due_sessions(sessions: &mut SessionTable, udp_cmd_tx: &mpsc::UnboundedSender<UdpCommand>, now: Instant) {
    let due: Vec<ProbeId> = sessions.iter().filter(|s| s.due(now)).map(|s| s.id).collect();
    for id in due {
        let Some(session) = sessions.get_mut(id) else { continue };
        let seq = session.emit_next(now);
        let packet = UdpPacket::ping(session.id, seq);
        let _ = udp_cmd_tx.send(UdpCommand::SendPing {
            addr: session.address_key(),
            dst: session.dst,
            probe_id: session.id,
            seq,
            dscp: session.dscp,
            data: packet.encode(),
        });
    }
}

fn wall_clock_now() -> TimePoint {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    TimePoint::new(now.as_secs() as i64, now.subsec_nanos() as i64)
}

fn handle_udp_event(
    event: UdpEvent,
    udp_cmd_tx: &mpsc::UnboundedSender<UdpCommand>,
    registry: &InboundRegistry,
    results: &mut ResultTable,
    reporter: &Reporter,
) {
    match event {
        UdpEvent::Sent { addr, probe_id, seq, dscp, t1 } => {
            results.record_sent(addr, probe_id, seq, dscp, t1, Instant::now());
        }
        UdpEvent::Received { bytes, from, ts, dscp } => {
            let Ok(packet) = UdpPacket::decode(&bytes) else {
                log::debug!("dropped malformed datagram from {from}");
                return;
            };

            match packet.kind {
                PacketKind::Ping => {
                    let pong = UdpPacket::pong(packet.probe_id, packet.seq);
                    let _ = udp_cmd_tx.send(UdpCommand::SendPong {
                        dst: from,
                        dscp: dscp.unwrap_or(Dscp::new(0)),
                        data: pong.encode(),
                    });

                    let t3 = wall_clock_now();
                    let report = SidechannelRecord {
                        addr: AddressKey::from_ip(from.ip()),
                        payload: UdpPacket::time_report(packet.probe_id, packet.seq, ts, t3),
                        observed_at: t3,
                    };
                    registry.push(AddressKey::from_ip(from.ip()), report);
                }
                PacketKind::Pong => {
                    let addr = AddressKey::from_ip(from.ip());
                    let observed_dscp = dscp.unwrap_or(Dscp::new(0));
                    if let Some(finished) = results.record_pong(addr, packet.probe_id, packet.seq, ts, observed_dscp) {
                        reporter.report(finished);
                    }
                }
                PacketKind::Hello | PacketKind::TimeReport => {
                    log::debug!("unexpected {:?} on the UDP socket from {from}", packet.kind);
                }
            }
        }
    }
}

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use codec::{AddressKey, Dscp};

pub type ProbeId = u32;
pub type SequenceNumber = u32;

/// A configured stream of PINGs to one peer with one id, one DSCP, one
/// interval.
///
/// Two sessions may point at the same destination address with different
/// DSCPs; each keeps its own `got_hello` state, but the destination address
/// they share resolves to a single [`crate::SidechannelWorker`] (not modeled
/// in this crate — see `SessionTable::addresses`).
#[derive(Debug, Clone)]
pub struct MeasurementSession {
    pub id: ProbeId,
    pub dst: SocketAddr,
    /// Probe interval, normalized to a single microsecond count so a
    /// zero-seconds/large-microseconds interval is never mishandled by a
    /// split-unit comparator.
    pub interval: Duration,
    pub dscp: Dscp,
    got_hello: bool,
    last_sent: Option<Instant>,
    last_seq: SequenceNumber,
}

impl MeasurementSession {
    pub fn new(id: ProbeId, dst: SocketAddr, interval: Duration, dscp: Dscp) -> Self {
        Self {
            id,
            dst,
            interval,
            dscp,
            got_hello: false,
            last_sent: None,
            last_seq: 0,
        }
    }

    pub fn address_key(&self) -> AddressKey {
        AddressKey::from_ip(self.dst.ip())
    }

    pub fn got_hello(&self) -> bool {
        self.got_hello
    }

    pub fn mark_hello_received(&mut self) {
        self.got_hello = true;
    }

    pub fn last_seq(&self) -> SequenceNumber {
        self.last_seq
    }

    /// A session is due when the hello gate is open and at least `interval`
    /// has elapsed since the last PING, or none has been sent yet.
    pub fn due(&self, now: Instant) -> bool {
        if !self.got_hello {
            return false;
        }
        match self.last_sent {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Advances the sequence counter and records `now` as the send time.
    /// Callers must only invoke this once the PING has actually been
    /// transmitted (T1 obtained), so `last_seq` stays dense.
    pub fn emit_next(&mut self, now: Instant) -> SequenceNumber {
        self.last_seq += 1;
        self.last_sent = Some(now);
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 60666)
    }

    #[test]
    fn not_due_until_hello_received() {
        let s = MeasurementSession::new(1, addr(), Duration::from_millis(500), Dscp::new(10));
        assert!(!s.due(Instant::now()));
    }

    #[test]
    fn due_immediately_after_hello_with_no_prior_send() {
        let mut s = MeasurementSession::new(1, addr(), Duration::from_millis(500), Dscp::new(10));
        s.mark_hello_received();
        assert!(s.due(Instant::now()));
    }

    #[test]
    fn not_due_again_until_interval_elapses() {
        let mut s = MeasurementSession::new(1, addr(), Duration::from_millis(500), Dscp::new(10));
        s.mark_hello_received();
        let now = Instant::now();
        assert_eq!(s.emit_next(now), 1);
        assert!(!s.due(now + Duration::from_millis(100)));
        assert!(s.due(now + Duration::from_millis(500)));
    }

    #[test]
    fn seq_is_dense_and_monotonic() {
        let mut s = MeasurementSession::new(1, addr(), Duration::from_millis(1), Dscp::new(0));
        s.mark_hello_received();
        let now = Instant::now();
        for expected in 1..=5 {
            assert_eq!(s.emit_next(now), expected);
        }
    }
}

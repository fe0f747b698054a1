mod result_table;
mod session;

pub use result_table::{FinalState, FinishedResult, ProbeResult, ResultKey, ResultTable, Timestamps};
pub use session::{MeasurementSession, ProbeId, SequenceNumber};

use ahash::AHashMap;
use codec::AddressKey;

/// All configured sessions, keyed by id. Multiple sessions may share a
/// destination address; `mark_hello_received` fans a side-channel hello out
/// to every session pointed at that address.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: AHashMap<ProbeId, MeasurementSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: AHashMap::new(),
        }
    }

    pub fn add(&mut self, session: MeasurementSession) {
        self.sessions.insert(session.id, session);
    }

    pub fn remove(&mut self, id: ProbeId) -> Option<MeasurementSession> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: ProbeId) -> Option<&MeasurementSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ProbeId) -> Option<&mut MeasurementSession> {
        self.sessions.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MeasurementSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MeasurementSession> {
        self.sessions.values_mut()
    }

    /// Opens the hello gate for every session whose destination address
    /// matches `addr`. Called when the side-channel worker for that address
    /// completes its handshake.
    pub fn mark_hello_received(&mut self, addr: AddressKey) {
        for session in self.sessions.values_mut() {
            if session.address_key() == addr {
                session.mark_hello_received();
            }
        }
    }

    /// The distinct destination addresses this table's sessions point at —
    /// one side-channel worker is needed per address, not per session.
    pub fn addresses(&self) -> impl Iterator<Item = AddressKey> + '_ {
        let mut seen = std::collections::HashSet::new();
        self.sessions
            .values()
            .map(|s| s.address_key())
            .filter(move |addr| seen.insert(*addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 60666)
    }

    #[test]
    fn hello_opens_every_session_at_that_address() {
        let mut table = SessionTable::new();
        table.add(MeasurementSession::new(1, addr(), Duration::from_secs(1), codec::Dscp::new(0)));
        table.add(MeasurementSession::new(2, addr(), Duration::from_secs(1), codec::Dscp::new(46)));

        table.mark_hello_received(AddressKey::from_ip(addr().ip()));

        assert!(table.get(1).unwrap().got_hello());
        assert!(table.get(2).unwrap().got_hello());
    }

    #[test]
    fn addresses_are_deduplicated_across_sessions() {
        let mut table = SessionTable::new();
        table.add(MeasurementSession::new(1, addr(), Duration::from_secs(1), codec::Dscp::new(0)));
        table.add(MeasurementSession::new(2, addr(), Duration::from_secs(1), codec::Dscp::new(46)));

        assert_eq!(table.addresses().count(), 1);
    }
}

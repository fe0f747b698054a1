use crate::address::AddressKey;
use crate::packet::{DecodeError, UdpPacket, PAYLOAD_LEN};
use crate::time::TimePoint;

/// `{ peer-addr(16B), udp-payload(48B), timepoint(16B) }`: one fixed-size
/// record carried over the TCP side-channel. No length prefix is needed
/// because every record is the same size.
pub const RECORD_LEN: usize = 16 + PAYLOAD_LEN + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidechannelRecord {
    pub addr: AddressKey,
    pub payload: UdpPacket,
    pub observed_at: TimePoint,
}

impl SidechannelRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..16].copy_from_slice(&self.addr.0);
        buf[16..16 + PAYLOAD_LEN].copy_from_slice(&self.payload.encode());
        let tp_off = 16 + PAYLOAD_LEN;
        buf[tp_off..tp_off + 8].copy_from_slice(&self.observed_at.secs.to_be_bytes());
        buf[tp_off + 8..tp_off + 16].copy_from_slice(&self.observed_at.nsecs.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < RECORD_LEN {
            return Err(DecodeError::ShortFrame {
                expected: RECORD_LEN,
                got: bytes.len(),
            });
        }

        let mut addr = [0u8; 16];
        addr.copy_from_slice(&bytes[0..16]);

        let payload = UdpPacket::decode(&bytes[16..16 + PAYLOAD_LEN])?;

        let tp_off = 16 + PAYLOAD_LEN;
        let secs = i64::from_be_bytes(bytes[tp_off..tp_off + 8].try_into().unwrap());
        let nsecs = i64::from_be_bytes(bytes[tp_off + 8..tp_off + 16].try_into().unwrap());

        Ok(Self {
            addr: AddressKey(addr),
            payload,
            observed_at: TimePoint::new(secs, nsecs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn roundtrip() {
        let rec = SidechannelRecord {
            addr: AddressKey::from_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            payload: UdpPacket::time_report(1, 2, TimePoint::new(5, 6), TimePoint::new(7, 8)),
            observed_at: TimePoint::new(9, 10),
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(SidechannelRecord::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn short_record_is_rejected() {
        let bytes = [0u8; RECORD_LEN - 1];
        assert!(matches!(
            SidechannelRecord::decode(&bytes),
            Err(DecodeError::ShortFrame { .. })
        ));
    }
}

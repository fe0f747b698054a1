use crate::time::TimePoint;

/// Fixed length of an encoded [`UdpPacket`] in bytes.
pub const PAYLOAD_LEN: usize = 48;

const KIND_OFFSET: usize = 0;
const SEQ_OFFSET: usize = 1;
const PROBE_ID_OFFSET: usize = 5;
const T2_OFFSET: usize = 9;
const T3_OFFSET: usize = 25;
const RESERVED_OFFSET: usize = 41;

/// The four packet shapes that travel over the UDP socket (`Ping`, `Pong`)
/// or the TCP side-channel (`TimeReport`, `Hello`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Ping,
    Pong,
    TimeReport,
    Hello,
}

impl PacketKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Ping => b'i',
            Self::Pong => b'o',
            Self::TimeReport => b't',
            Self::Hello => b'h',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'i' => Some(Self::Ping),
            b'o' => Some(Self::Pong),
            b't' => Some(Self::TimeReport),
            b'h' => Some(Self::Hello),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short frame: expected at least {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },
    #[error("unrecognized packet kind byte {0:#04x}")]
    BadKind(u8),
}

/// The fixed-length UDP probe payload. `t2`/`t3` are only meaningful when
/// `kind == PacketKind::TimeReport`; `Ping`/`Pong` carry no timestamps in
/// the body, since T1/T4 are observed by the [`crate::Timestamper`] at
/// send/receive time rather than encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPacket {
    pub kind: PacketKind,
    pub seq: u32,
    pub probe_id: u32,
    pub t2: TimePoint,
    pub t3: TimePoint,
}

impl UdpPacket {
    pub fn ping(probe_id: u32, seq: u32) -> Self {
        Self {
            kind: PacketKind::Ping,
            seq,
            probe_id,
            t2: TimePoint::ZERO,
            t3: TimePoint::ZERO,
        }
    }

    pub fn pong(probe_id: u32, seq: u32) -> Self {
        Self {
            kind: PacketKind::Pong,
            seq,
            probe_id,
            t2: TimePoint::ZERO,
            t3: TimePoint::ZERO,
        }
    }

    /// The first frame a side-channel worker writes once connected, so the
    /// accepting end has something to read before any real time report
    /// exists.
    pub fn hello() -> Self {
        Self {
            kind: PacketKind::Hello,
            seq: 0,
            probe_id: 0,
            t2: TimePoint::ZERO,
            t3: TimePoint::ZERO,
        }
    }

    pub fn time_report(probe_id: u32, seq: u32, t2: TimePoint, t3: TimePoint) -> Self {
        Self {
            kind: PacketKind::TimeReport,
            seq,
            probe_id,
            t2,
            t3,
        }
    }

    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[KIND_OFFSET] = self.kind.to_byte();
        buf[SEQ_OFFSET..SEQ_OFFSET + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[PROBE_ID_OFFSET..PROBE_ID_OFFSET + 4].copy_from_slice(&self.probe_id.to_be_bytes());
        write_timepoint(&mut buf[T2_OFFSET..T2_OFFSET + 16], &self.t2);
        write_timepoint(&mut buf[T3_OFFSET..T3_OFFSET + 16], &self.t3);
        // bytes[RESERVED_OFFSET..] are already zero.
        debug_assert_eq!(RESERVED_OFFSET + 7, PAYLOAD_LEN);
        buf
    }

    /// Decodes a payload from `bytes`. Unknown `kind` values and frames
    /// shorter than [`PAYLOAD_LEN`] are rejected without allocating.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < PAYLOAD_LEN {
            return Err(DecodeError::ShortFrame {
                expected: PAYLOAD_LEN,
                got: bytes.len(),
            });
        }

        let kind = PacketKind::from_byte(bytes[KIND_OFFSET]).ok_or(DecodeError::BadKind(bytes[KIND_OFFSET]))?;
        let seq = u32::from_be_bytes(bytes[SEQ_OFFSET..SEQ_OFFSET + 4].try_into().unwrap());
        let probe_id = u32::from_be_bytes(
            bytes[PROBE_ID_OFFSET..PROBE_ID_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        let t2 = read_timepoint(&bytes[T2_OFFSET..T2_OFFSET + 16]);
        let t3 = read_timepoint(&bytes[T3_OFFSET..T3_OFFSET + 16]);

        Ok(Self {
            kind,
            seq,
            probe_id,
            t2,
            t3,
        })
    }
}

fn write_timepoint(dst: &mut [u8], tp: &TimePoint) {
    dst[0..8].copy_from_slice(&tp.secs.to_be_bytes());
    dst[8..16].copy_from_slice(&tp.nsecs.to_be_bytes());
}

fn read_timepoint(src: &[u8]) -> TimePoint {
    let secs = i64::from_be_bytes(src[0..8].try_into().unwrap());
    let nsecs = i64::from_be_bytes(src[8..16].try_into().unwrap());
    TimePoint::new(secs, nsecs)
}

pub mod address;
pub mod packet;
pub mod sidechannel;
pub mod time;

pub use address::AddressKey;
pub use packet::{PacketKind, UdpPacket, DecodeError, PAYLOAD_LEN};
pub use sidechannel::{SidechannelRecord, RECORD_LEN};
pub use time::{Dscp, TimePoint};

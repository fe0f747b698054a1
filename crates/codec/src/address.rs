use std::net::{IpAddr, Ipv6Addr};

/// The address half of a probe's identity: always the 16 raw bytes of an
/// IPv6 address, with IPv4 peers stored in their v4-mapped form. Port is
/// held separately by callers (a `MeasurementSession`/`ResultTable` entry
/// key pairs this with a `SocketAddr`'s port where needed).
///
/// Storing only the 16 address bytes here (never a raw `sockaddr` copy)
/// sidesteps the original implementation's `addr_t`/`memcpy` size mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressKey(pub [u8; 16]);

impl AddressKey {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self(v4.to_ipv6_mapped().octets()),
            IpAddr::V6(v6) => Self(v6.octets()),
        }
    }

    pub fn to_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }
}

impl From<IpAddr> for AddressKey {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn v4_addresses_map_into_v6() {
        let a = AddressKey::from_ip(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        let b = AddressKey::from_ip(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(a, b);

        let different = AddressKey::from_ip(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)));
        assert_ne!(a, different);
    }

    #[test]
    fn v6_addresses_round_trip() {
        let ip = "2001:db8::1".parse().unwrap();
        let key = AddressKey::from_ip(ip);
        assert_eq!(IpAddr::V6(key.to_ipv6()), ip);
    }
}

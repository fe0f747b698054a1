use std::fmt;

/// A point in time expressed as signed seconds and nanoseconds, matching the
/// wire representation used by [`crate::packet::UdpPacket`]'s `t2`/`t3`
/// fields and the side-channel record.
///
/// `TimePoint::ZERO` is the wire-level "no timestamp available" value a
/// [`Timestamper`] reports when it could not obtain an authoritative
/// timestamp; callers that need "not yet observed" (as opposed to "observed,
/// but invalid") should use `Option<TimePoint>` rather than relying on this
/// sentinel, per the zero-sentinel redesign note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint {
    pub secs: i64,
    pub nsecs: i64,
}

impl TimePoint {
    pub const ZERO: TimePoint = TimePoint { secs: 0, nsecs: 0 };

    pub fn new(secs: i64, nsecs: i64) -> Self {
        Self { secs, nsecs }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Total nanoseconds since the epoch, widened to `i128` so subtracting
    /// two `TimePoint`s can never overflow.
    pub fn as_nanos(&self) -> i128 {
        self.secs as i128 * 1_000_000_000 + self.nsecs as i128
    }

    /// Signed nanosecond difference `self - other`.
    pub fn diff_nanos(&self, other: &TimePoint) -> i128 {
        self.as_nanos() - other.as_nanos()
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nsecs.unsigned_abs())
    }
}

/// A 6-bit Differentiated Services Code Point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dscp(u8);

impl Dscp {
    pub const MASK: u8 = 0b0011_1111;

    pub fn new(value: u8) -> Self {
        Self(value & Self::MASK)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl From<u8> for Dscp {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Dscp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dscp_masks_to_six_bits() {
        assert_eq!(Dscp::new(0xFF).value(), 0x3F);
        assert_eq!(Dscp::new(10).value(), 10);
    }

    #[test]
    fn diff_nanos_is_signed() {
        let a = TimePoint::new(10, 0);
        let b = TimePoint::new(10, 500);
        assert_eq!(b.diff_nanos(&a), 500);
        assert_eq!(a.diff_nanos(&b), -500);
    }

    #[test]
    fn zero_is_the_sentinel() {
        assert!(TimePoint::ZERO.is_zero());
        assert!(!TimePoint::new(0, 1).is_zero());
    }
}

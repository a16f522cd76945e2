use std::fmt::{Display, Formatter};

/// A 16 bit sequence number that wraps around. Sequence numbers are compared relative to each
///  other: `a` is newer than `b` if it is less than half the number range ahead of `b`. There is
///  deliberately no [Ord] implementation since that relation is not transitive.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(i16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: i16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i16 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn minus(&self, distance: u16) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(distance as i16))
    }

    /// The signed distance from `other` to `self`, i.e. positive if `self` is newer
    pub fn distance_from(&self, other: SequenceNumber) -> i16 {
        self.0.wrapping_sub(other.0)
    }

    pub fn is_newer_than(&self, other: SequenceNumber) -> bool {
        self.distance_from(other) > 0
    }
}

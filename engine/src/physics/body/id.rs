//! Body identifiers
//!
//! A [`BodyId`] packs the slot index of a body together with the sequence
//! number the slot had when the body was registered. Recycling a slot bumps
//! the sequence number, so a handle to the previous occupant stops matching.

use std::fmt;

/// Handle identifying a body for as long as it is registered with a
/// [`BodyManager`](super::BodyManager).
///
/// Bits 0..23 hold the slot index, bits 23..31 the sequence number and the
/// top bit is always clear for a valid id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(u32);

impl BodyId {
    /// Sentinel that never resolves to a body
    pub const INVALID: BodyId = BodyId(0xffff_ffff);

    /// Largest slot index a body id can address
    pub const MAX_BODY_INDEX: u32 = 0x007f_ffff;

    const SEQUENCE_SHIFT: u32 = 23;

    /// Build an id from a slot index and a sequence number
    pub fn new(index: u32, sequence: u8) -> Self {
        debug_assert!(index <= Self::MAX_BODY_INDEX, "body index {index} out of range");
        Self((index & Self::MAX_BODY_INDEX) | (u32::from(sequence) << Self::SEQUENCE_SHIFT))
    }

    /// Rebuild an id from its packed representation
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Packed representation, suitable for storing in atomics
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Slot index in the body array
    pub fn index(self) -> u32 {
        self.0 & Self::MAX_BODY_INDEX
    }

    /// Sequence number of the slot at registration time
    pub fn sequence(self) -> u8 {
        ((self.0 >> Self::SEQUENCE_SHIFT) & 0xff) as u8
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for BodyId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "BodyId({}:{})", self.index(), self.sequence())
        } else {
            write!(f, "BodyId(invalid)")
        }
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

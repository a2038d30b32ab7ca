//! This module defines range-checked types for LCP point indices, expansion
//! unit counts and message types, meant to simplify correct usage of the API.

use snafu::{ensure, OptionExt, Snafu};

use core::convert::TryInto;
use core::ops::Deref;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid point index.
    #[snafu(display("Invalid point index"))]
    InvalidIndex,
    /// The value isn't a valid expansion unit count.
    #[snafu(display("Invalid expansion unit count"))]
    InvalidUnitCount,
    /// The three type bits don't name a known message type.
    #[snafu(display("Invalid message type bits {bits:#05b}"))]
    InvalidType { bits: u8 },
}

const fn invalid_index() -> InvalidIndexSnafu {
    InvalidIndexSnafu
}

const fn invalid_unit_count() -> InvalidUnitCountSnafu {
    InvalidUnitCountSnafu
}

/// Highest point index of a fully expanded link.
pub const MAX_POINTS: u8 = 128;
/// Number of points that are always present.
pub const CORE_POINTS: u8 = 32;
/// Points added by each expansion unit.
pub const POINTS_PER_UNIT: u8 = 16;
/// Maximum number of expansion units.
pub const MAX_UNITS: u8 = 6;

/// `PointIndex` is a range-checked \[1, 128\] integer, naming one control or
/// indication point.
///
/// ## Example
/// ```
/// use lcp_proto::PointIndex;
/// let idx = PointIndex::new(17).unwrap();
/// assert_eq!(*idx, 17);
/// assert!(PointIndex::new(0).is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct PointIndex(u8);

/// Create a new [`PointIndex`], panics if it is out of range.
pub const fn point(i: u8) -> PointIndex {
    if i >= 1 && i <= MAX_POINTS {
        return PointIndex(i);
    }
    panic!("Invalid point index.")
}

impl PointIndex {
    /// Create a new point index, checking that it is in \[1, 128\].
    /// # Errors
    /// Returns [`Error::InvalidIndex`] if `index` is out of range.
    pub fn new(index: impl TryInto<u8>) -> Result<Self, Error> {
        let index = index.try_into().ok().with_context(invalid_index)?;
        ensure!((1..=MAX_POINTS).contains(&index), invalid_index());
        Ok(Self(index))
    }

    /// Zero based bit position within a bit vector.
    pub(crate) const fn bit(self) -> u32 {
        (self.0 - 1) as u32
    }

    /// Index from a zero based bit position.
    pub(crate) const fn from_bit(bit: u32) -> Self {
        Self(bit as u8 + 1)
    }

    /// The 7-bit on-wire form. Point 128 wraps to 0.
    pub(crate) const fn to_wire(self) -> u8 {
        self.0 & 0x7f
    }

    pub(crate) const fn from_wire(bits: u8) -> Self {
        match bits & 0x7f {
            0 => Self(MAX_POINTS),
            n => Self(n),
        }
    }
}

impl Deref for PointIndex {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq<usize> for PointIndex {
    fn eq(&self, other: &usize) -> bool {
        self.0 as usize == *other
    }
}

/// Trait to convert `T: TryInto<u8>` into a [`PointIndex`].
pub trait IntoPointIndex {
    /// Convert self to a `PointIndex`.
    /// # Errors
    /// Returns [`Error::InvalidIndex`] if self isn't a valid index.
    fn into_point_index(self) -> Result<PointIndex, Error>;
}

impl IntoPointIndex for PointIndex {
    fn into_point_index(self) -> Result<PointIndex, Error> {
        Ok(self)
    }
}

impl<T> IntoPointIndex for T
where
    T: TryInto<u8>,
{
    fn into_point_index(self) -> Result<PointIndex, Error> {
        PointIndex::new(self)
    }
}

/// Number of configured expansion units, \[0, 6\].
///
/// Fixes the bit vector length, and thus the size of `All` messages, for
/// the whole session.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash, Default)]
#[repr(transparent)]
pub struct ExpansionUnits(u8);

/// Create a new [`ExpansionUnits`], panics if it is out of range.
pub const fn units(n: u8) -> ExpansionUnits {
    if n <= MAX_UNITS {
        return ExpansionUnits(n);
    }
    panic!("Invalid expansion unit count.")
}

impl ExpansionUnits {
    /// # Errors
    /// Returns [`Error::InvalidUnitCount`] if `count` is larger than 6.
    pub fn new(count: impl TryInto<u8>) -> Result<Self, Error> {
        let count = count.try_into().ok().with_context(invalid_unit_count)?;
        ensure!(count <= MAX_UNITS, invalid_unit_count());
        Ok(Self(count))
    }

    /// Number of points in the bit vector, `32 + 16 × count`.
    pub const fn vector_len(self) -> u8 {
        CORE_POINTS + POINTS_PER_UNIT * self.0
    }

    /// Size in bytes of an `All` payload, `4 + 2 × count`.
    pub const fn all_payload_len(self) -> usize {
        self.vector_len() as usize / 8
    }

    /// Checks that `index` addresses a point present with this many units.
    pub fn contains(self, index: PointIndex) -> bool {
        *index <= self.vector_len()
    }
}

impl Deref for ExpansionUnits {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The three message types. The discriminant is the 3-bit type field.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum MessageType {
    /// Request for the peer's complete state.
    Recall = 0b100,
    /// Complete bit vector.
    All = 0b001,
    /// Single point change.
    Update = 0b111,
}

impl MessageType {
    /// Type bits shifted into header position.
    pub const fn header_bits(self) -> u8 {
        (self as u8) << 5
    }

    /// Decode the type from a header byte.
    /// # Errors
    /// Returns [`Error::InvalidType`] for the five undefined bit patterns.
    pub fn from_header(header: u8) -> Result<Self, Error> {
        match header >> 5 {
            0b100 => Ok(Self::Recall),
            0b001 => Ok(Self::All),
            0b111 => Ok(Self::Update),
            bits => InvalidTypeSnafu { bits }.fail(),
        }
    }

    /// Payload size carried by this message type.
    pub const fn payload_len(self, units: ExpansionUnits) -> usize {
        match self {
            Self::Recall => 0,
            Self::Update => 1,
            Self::All => units.all_payload_len(),
        }
    }
}

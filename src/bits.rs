//! The control/indication state of a link, one bit per point.
//!
//! The first 32 points are always present, each expansion unit adds 16 more.
//! Points 1 to 16 are reserved for fixed functions, see [`HEALTH_BIT`].

use snafu::{ensure, Snafu};

use crate::types::{ExpansionUnits, PointIndex, MAX_POINTS};

/// Point reporting whether the peer has been heard from within the poll timeout.
pub const HEALTH_BIT: PointIndex = crate::types::point(16);

/// Error type for bit vector operations.
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// The index is outside of the configured vector.
    #[snafu(display("Point {index} is outside of the {len} point vector"))]
    IndexOutOfRange { index: u8, len: u8 },
    /// The replacement vector doesn't match the configured length.
    #[snafu(display("Vector length {actual} doesn't match the configured {expected}"))]
    LengthMismatch { expected: u8, actual: u8 },
    /// The point is computed by the link and can't be set directly.
    #[snafu(display("Point {index} is read only"))]
    ReadOnlyPoint { index: u8 },
}

/// Fixed-length bit vector of up to 128 points.
///
/// Bit `n - 1` of the inner integer holds point `n`.
#[derive(PartialEq, Eq, Copy, Clone, Hash, Default)]
pub struct BitVector {
    bits: u128,
    units: ExpansionUnits,
}

impl BitVector {
    /// All points off.
    pub const fn new(units: ExpansionUnits) -> Self {
        Self { bits: 0, units }
    }

    /// Build a vector from the packed `All` payload layout, bit 0 of byte 0
    /// being point 1. `bytes` must hold exactly `4 + 2 × units` bytes.
    /// # Errors
    /// Returns [`Error::LengthMismatch`] for any other length.
    pub fn from_bytes(units: ExpansionUnits, bytes: &[u8]) -> Result<Self, Error> {
        ensure!(
            bytes.len() == units.all_payload_len(),
            LengthMismatchSnafu {
                expected: units.vector_len(),
                actual: (bytes.len() * 8).min(u8::MAX as usize) as u8,
            }
        );
        let mut le = [0u8; 16];
        le[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bits: u128::from_le_bytes(le),
            units,
        })
    }

    /// The packed `All` payload layout.
    pub fn to_bytes(&self) -> arrayvec::ArrayVec<u8, 16> {
        let le = self.bits.to_le_bytes();
        le[..self.units.all_payload_len()].iter().copied().collect()
    }

    /// Number of points in the vector.
    pub const fn len(&self) -> u8 {
        self.units.vector_len()
    }

    pub const fn units(&self) -> ExpansionUnits {
        self.units
    }

    /// Returns the state of a point, `None` if the index is beyond the vector.
    pub fn get(&self, index: PointIndex) -> Option<bool> {
        if self.units.contains(index) {
            Some(self.bits & (1 << index.bit()) != 0)
        } else {
            None
        }
    }

    /// Set a single point, returning whether its value changed.
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if `index` is beyond the vector.
    pub fn apply(&mut self, index: PointIndex, state: bool) -> Result<bool, Error> {
        ensure!(
            self.units.contains(index),
            IndexOutOfRangeSnafu {
                index: *index,
                len: self.len(),
            }
        );
        let mask = 1u128 << index.bit();
        let old = self.bits;
        if state {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
        Ok(old != self.bits)
    }

    /// Replace the whole vector.
    /// # Errors
    /// Returns [`Error::LengthMismatch`] if `other` has a different length.
    pub fn replace_all(&mut self, other: &BitVector) -> Result<(), Error> {
        ensure!(
            other.units == self.units,
            LengthMismatchSnafu {
                expected: self.len(),
                actual: other.len(),
            }
        );
        self.bits = other.bits;
        Ok(())
    }

    /// Every point whose value differs between `self` and `new`, in
    /// ascending index order, paired with its value in `new`.
    pub fn diff(&self, new: &BitVector) -> Diff {
        diff(self, new)
    }

    /// Iterate over all set points.
    pub fn iter_set(&self) -> Diff {
        Diff {
            changed: self.bits,
            target: self.bits,
        }
    }
}

/// Lazy sequence of `(index, state)` pairs produced by [`diff`].
#[derive(Debug, Clone)]
pub struct Diff {
    changed: u128,
    target: u128,
}

impl Iterator for Diff {
    type Item = (PointIndex, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.changed == 0 {
            return None;
        }
        let bit = self.changed.trailing_zeros();
        self.changed &= self.changed - 1;
        Some((PointIndex::from_bit(bit), self.target & (1 << bit) != 0))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.changed.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Diff {}

/// Points that differ between `old` and `new`. Only the points both vectors
/// have in common are compared.
pub fn diff(old: &BitVector, new: &BitVector) -> Diff {
    let common = old.len().min(new.len());
    let mask = if common >= MAX_POINTS {
        u128::MAX
    } else {
        (1u128 << common) - 1
    };
    Diff {
        changed: (old.bits ^ new.bits) & mask,
        target: new.bits,
    }
}

impl core::fmt::Debug for BitVector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BitVector[{}](", self.len())?;
        for byte in self.to_bytes() {
            write!(f, "{:08b}", byte.reverse_bits())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{point, units};

    fn vector(units_: u8, set: &[u8]) -> BitVector {
        let mut v = BitVector::new(units(units_));
        for &i in set {
            v.apply(point(i), true).unwrap();
        }
        v
    }

    #[test]
    fn test_apply() {
        let mut v = BitVector::new(units(0));
        assert_eq!(v.apply(point(1), true), Ok(true));
        assert_eq!(v.apply(point(1), true), Ok(false));
        assert_eq!(v.get(point(1)), Some(true));
        assert_eq!(v.apply(point(1), false), Ok(true));
        assert_eq!(v.get(point(1)), Some(false));
        assert_eq!(v.get(point(33)), None);
    }

    #[test]
    fn test_index_bounds() {
        for n in 0..=6u8 {
            let mut v = BitVector::new(units(n));
            let len = v.len();
            assert_eq!(len, 32 + 16 * n);
            assert!(v.apply(point(1), true).is_ok());
            assert!(v.apply(point(len), true).is_ok());
            if len < 128 {
                assert_eq!(
                    v.apply(point(len + 1), true),
                    Err(Error::IndexOutOfRange {
                        index: len + 1,
                        len
                    })
                );
            }
        }
    }

    #[test]
    fn test_byte_layout() {
        let v = vector(1, &[1, 9, 16, 48]);
        assert_eq!(v.to_bytes().as_slice(), &[0x01, 0x81, 0, 0, 0, 0x80]);
        assert_eq!(BitVector::from_bytes(units(1), &v.to_bytes()), Ok(v));
        assert_eq!(
            BitVector::from_bytes(units(1), &[0; 4]),
            Err(Error::LengthMismatch {
                expected: 48,
                actual: 32
            })
        );
    }

    #[test]
    fn test_diff_idempotent() {
        let v = vector(2, &[3, 17, 64]);
        assert_eq!(diff(&v, &v).count(), 0);
    }

    #[test]
    fn test_diff_ascending() {
        let old = vector(6, &[2, 5, 128]);
        let new = vector(6, &[5, 7, 100]);
        let changes: Vec<_> = old.diff(&new).collect();
        assert_eq!(
            changes,
            vec![
                (point(2), false),
                (point(7), true),
                (point(100), true),
                (point(128), false)
            ]
        );
    }

    #[test]
    fn test_diff_applied_equals_replace() {
        let v1 = vector(3, &[1, 2, 3, 40, 80]);
        let v2 = vector(3, &[2, 41, 79, 80]);

        let mut patched = v1;
        for (index, state) in diff(&v1, &v2) {
            patched.apply(index, state).unwrap();
        }
        let mut replaced = v1;
        replaced.replace_all(&v2).unwrap();
        assert_eq!(patched, v2);
        assert_eq!(replaced, v2);
    }

    #[test]
    fn test_replace_length_mismatch() {
        let mut v = vector(0, &[1]);
        let other = vector(1, &[2]);
        assert_eq!(
            v.replace_all(&other),
            Err(Error::LengthMismatch {
                expected: 32,
                actual: 48
            })
        );
        assert_eq!(v, vector(0, &[1]));
    }
}

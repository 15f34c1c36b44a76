//! Heap addresses and address ranges.
//!
//! The pool never dereferences the memory it manages. It only does the
//! accounting, so addresses are plain integers wrapped in a newtype and
//! spans are explicit `[low, high)` pairs.

use std::fmt;

/// A byte address inside an externally owned heap region.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub usize);

impl Address {
    /// The null address. Never inside a managed range.
    pub const NULL: Address = Address(0);

    /// Return the raw numeric value.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// The address `bytes` past this one.
    ///
    /// Panics on overflow, which would mean a corrupt range descriptor.
    #[inline]
    pub fn offset(self, bytes: usize) -> Address {
        Address(
            self.0
                .checked_add(bytes)
                .expect("address arithmetic overflowed"),
        )
    }

    /// The number of bytes from `lower` up to `self`.
    ///
    /// Saturates at zero if `lower` is above `self`.
    #[inline]
    pub fn distance_from(self, lower: Address) -> usize {
        self.0.saturating_sub(lower.0)
    }

    /// Round up to the next multiple of `alignment` (a power of two).
    #[inline]
    pub fn align_up(self, alignment: usize) -> Address {
        debug_assert!(alignment.is_power_of_two(), "alignment must be a power of 2");
        Address((self.0 + alignment - 1) & !(alignment - 1))
    }

    #[inline]
    pub fn is_aligned(self, alignment: usize) -> bool {
        self.0 & (alignment - 1) == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for Address {
    fn from(raw: usize) -> Self {
        Address(raw)
    }
}

/// A half-open byte range `[low, high)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddressRange {
    pub low: Address,
    pub high: Address,
}

impl AddressRange {
    /// Create a range. `low` must not be above `high`.
    pub fn new(low: Address, high: Address) -> Self {
        debug_assert!(low <= high, "inverted address range {:?}..{:?}", low, high);
        AddressRange { low, high }
    }

    /// Create a range from a start address and a length in bytes.
    pub fn with_size(low: Address, size: usize) -> Self {
        AddressRange {
            low,
            high: low.offset(size),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.high.distance_from(self.low)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.low >= self.high
    }

    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        self.low <= address && address < self.high
    }

    /// True if `other` lies entirely inside this range.
    #[inline]
    pub fn encloses(&self, other: &AddressRange) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    /// True if the two ranges share at least one byte.
    #[inline]
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.low < other.high && other.low < self.high
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.low.0, self.high.0)
    }
}

//! Heap region descriptors handed to the pool after a sweep.
//!
//! The region manager and the sweep itself live outside this crate. What
//! the pool needs from them is the region's bounds and the live spans the
//! sweep found, in ascending address order. Everything between live spans
//! is dead.

use crate::address::{Address, AddressRange};
use crate::error::PoolError;

/// A swept heap region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapRegion {
    range: AddressRange,
    live: Vec<AddressRange>,
}

impl HeapRegion {
    /// A region with no live objects.
    pub fn new(low: Address, high: Address) -> Self {
        HeapRegion {
            range: AddressRange::new(low, high),
            live: Vec::new(),
        }
    }

    /// A region with the given live spans, which must be sorted.
    pub fn with_live_spans(low: Address, high: Address, live: Vec<AddressRange>) -> Self {
        HeapRegion {
            range: AddressRange::new(low, high),
            live,
        }
    }

    /// Record a live object. Spans must be added in ascending order.
    pub fn mark_live(&mut self, low: Address, size: usize) {
        self.live.push(AddressRange::with_size(low, size));
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn low(&self) -> Address {
        self.range.low
    }

    pub fn high(&self) -> Address {
        self.range.high
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn live_spans(&self) -> &[AddressRange] {
        &self.live
    }

    pub fn live_bytes(&self) -> usize {
        self.live.iter().map(AddressRange::size).sum()
    }

    /// Check that live spans are non-empty, sorted, disjoint, and inside
    /// the region.
    pub fn validate(&self) -> Result<(), PoolError> {
        let malformed = |reason| PoolError::MalformedRegion {
            region: self.range,
            reason,
        };

        let mut cursor = self.range.low;
        for span in &self.live {
            if span.is_empty() {
                return Err(malformed("empty live span"));
            }
            if !self.range.encloses(span) {
                return Err(malformed("live span outside region"));
            }
            if span.low < cursor {
                return Err(malformed("live spans unsorted or overlapping"));
            }
            cursor = span.high;
        }
        Ok(())
    }

    /// The dead spans between live objects, in ascending order.
    ///
    /// Assumes `validate()` has passed.
    pub fn dead_spans(&self) -> impl Iterator<Item = AddressRange> + '_ {
        let mut cursor = self.range.low;
        let end = self.range.high;
        self.live
            .iter()
            .map(Some)
            .chain(std::iter::once(None))
            .filter_map(move |span| {
                let gap_end = span.map_or(end, |s| s.low);
                let gap = AddressRange::new(cursor, gap_end);
                if let Some(s) = span {
                    cursor = s.high;
                }
                (!gap.is_empty()).then_some(gap)
            })
    }
}

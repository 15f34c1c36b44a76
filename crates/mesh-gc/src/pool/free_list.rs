//! Address-ordered free list.
//!
//! Entries are stored in ascending address order; the "next" link of entry
//! `i` is entry `i + 1`. A `FreeEntryId` is a position in the list and is
//! invalidated by the next rebuild.

use std::fmt;

use crate::address::{Address, AddressRange};

/// A free chunk header: `size` bytes starting at `start`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    pub start: Address,
    pub size: usize,
}

impl FreeEntry {
    pub fn new(start: Address, size: usize) -> Self {
        FreeEntry { start, size }
    }

    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::with_size(self.start, self.size)
    }
}

impl fmt::Debug for FreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeEntry({:?}, {:#x})", self.start, self.size)
    }
}

impl fmt::Display for FreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.start, self.end())
    }
}

/// Position of an entry in the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FreeEntryId(usize);

impl FreeEntryId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct FreeList {
    entries: Vec<FreeEntry>,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList {
            entries: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<FreeEntryId> {
        (!self.entries.is_empty()).then_some(FreeEntryId(0))
    }

    pub fn tail(&self) -> Option<FreeEntryId> {
        self.entries.len().checked_sub(1).map(FreeEntryId)
    }

    pub fn get(&self, id: FreeEntryId) -> Option<&FreeEntry> {
        self.entries.get(id.0)
    }

    pub fn next(&self, id: FreeEntryId) -> Option<FreeEntryId> {
        let next = id.0 + 1;
        (next < self.entries.len()).then_some(FreeEntryId(next))
    }

    pub fn iter(&self) -> impl Iterator<Item = (FreeEntryId, &FreeEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (FreeEntryId(i), e))
    }

    pub fn entries(&self) -> &[FreeEntry] {
        &self.entries
    }

    /// Drop every entry after `previous`, or every entry if `None`.
    pub fn truncate_after(&mut self, previous: Option<FreeEntryId>) {
        let keep = previous.map_or(0, |id| (id.0 + 1).min(self.entries.len()));
        self.entries.truncate(keep);
    }

    /// Link `entry` after the current tail. It must lie above the tail.
    pub fn push(&mut self, entry: FreeEntry) -> FreeEntryId {
        debug_assert!(
            self.entries.last().map_or(true, |last| last.end() <= entry.start),
            "free list must stay address ordered: {:?} after {:?}",
            entry,
            self.entries.last()
        );
        self.entries.push(entry);
        FreeEntryId(self.entries.len() - 1)
    }

    /// Link `entry` at its address-ordered position. If it overlaps an
    /// entry already on the list, nothing is linked and that entry's id is
    /// returned as the error.
    pub fn insert_sorted(&mut self, entry: FreeEntry) -> Result<FreeEntryId, FreeEntryId> {
        if let Some(id) = self.find_overlapping(&entry.range()) {
            return Err(id);
        }
        let index = self.entries.partition_point(|e| e.start < entry.start);
        self.entries.insert(index, entry);
        Ok(FreeEntryId(index))
    }

    /// Find the lowest entry sharing a byte with `range`.
    pub fn find_overlapping(&self, range: &AddressRange) -> Option<FreeEntryId> {
        let index = self.entries.partition_point(|e| e.end() <= range.low);
        let entry = self.entries.get(index)?;
        entry.range().overlaps(range).then_some(FreeEntryId(index))
    }

    /// Find the entry that fully covers `range`.
    pub fn find_enclosing(&self, range: &AddressRange) -> Option<FreeEntryId> {
        let index = self.entries.partition_point(|e| e.end() <= range.low);
        let entry = self.entries.get(index)?;
        entry.range().encloses(range).then_some(FreeEntryId(index))
    }

    /// Remove `range` from the entry `id` covering it, keeping whatever is
    /// left on either side. Remainders below `minimum` are dropped and their
    /// byte count returned.
    pub fn carve(&mut self, id: FreeEntryId, range: &AddressRange, minimum: usize) -> usize {
        let entry = self.entries.remove(id.0);
        let mut dropped = 0;
        let mut index = id.0;
        for piece in [
            AddressRange::new(entry.start, range.low),
            AddressRange::new(range.high, entry.end()),
        ] {
            if piece.is_empty() {
                continue;
            }
            if piece.size() >= minimum {
                self.entries.insert(index, FreeEntry::new(piece.low, piece.size()));
                index += 1;
            } else {
                dropped += piece.size();
            }
        }
        dropped
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn largest(&self) -> usize {
        self.entries.iter().map(|e| e.size).max().unwrap_or(0)
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{}", entry)?;
            first = false;
        }
        if first {
            write!(f, "<empty>")?;
        }
        Ok(())
    }
}

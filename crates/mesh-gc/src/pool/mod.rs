//! Bump-pointer memory pool.
//!
//! The pool manages the accounting for one contiguous heap range. Objects
//! and thread-local heaps (TLHs) are carved off the front of the bump
//! window `[allocate_pointer, top_pointer)`; allocation never searches the
//! free list. After a sweep, the dead spans of each region are linked into
//! an address-ordered free list, region by region.
//!
//! Gaps smaller than `minimum_free_entry_size` are never linked. They are
//! counted as dark matter and stay unusable until the next sweep finds them
//! merged with a neighbour. That keeps allocation O(1) at the cost of a
//! little unreclaimable space.
//!
//! No operation locks. Every mutating method takes `&mut self`, so the
//! caller's serialization (normally exclusive VM access held by the one
//! thread allocating or sweeping) is what makes the pool safe.

pub mod free_list;

pub use free_list::{FreeEntry, FreeEntryId, FreeList};

use std::fmt;

use tracing::{debug, error, trace};

use crate::address::{Address, AddressRange};
use crate::config::GcConfig;
use crate::error::PoolError;
use crate::region::HeapRegion;

/// Why the pool is being reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetCause {
    #[default]
    Any,
    /// A compaction moved every object out of this pool's range.
    ForCompact,
}

/// Pool figures. Free-list numbers describe the last rebuild; allocation
/// numbers are counted since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Bytes linked into the free list.
    pub free_memory_bytes: usize,
    /// Bytes in free gaps too small to link.
    pub dark_matter_bytes: usize,
    pub free_entry_count: usize,
    pub largest_free_entry: usize,
    pub allocation_count: u64,
    pub allocated_bytes: usize,
    /// Allocations made through the collector entry points. Also counted
    /// in `allocation_count`.
    pub collector_allocation_count: u64,
}

/// A bump-pointer pool over an externally owned address range.
pub struct BumpPointerPool {
    minimum_free_entry_size: usize,
    /// Everything the pool owns. The bump window is a sub-range of it; any
    /// part outside the window is either allocated or on the free list.
    managed: AddressRange,
    allocate_pointer: Address,
    top_pointer: Address,
    free_list: FreeList,
    /// Tail of the free list as of the last rebuild. Cleared by allocation.
    last_free_entry: Option<FreeEntryId>,
    stats: PoolStats,
}

impl BumpPointerPool {
    /// Create a pool that manages nothing yet. Give it memory with
    /// `expand_with_range`.
    pub fn new(minimum_free_entry_size: usize) -> Self {
        debug_assert!(minimum_free_entry_size > 0, "free entry floor must be positive");
        BumpPointerPool {
            minimum_free_entry_size,
            managed: AddressRange::default(),
            allocate_pointer: Address::NULL,
            top_pointer: Address::NULL,
            free_list: FreeList::new(),
            last_free_entry: None,
            stats: PoolStats::default(),
        }
    }

    /// Create a pool that manages `[low, high)` with the whole range free.
    pub fn with_range(minimum_free_entry_size: usize, low: Address, high: Address) -> Self {
        let mut pool = Self::new(minimum_free_entry_size);
        pool.managed = AddressRange::new(low, high);
        pool.allocate_pointer = low;
        pool.top_pointer = high;
        pool
    }

    pub fn from_config(config: &GcConfig) -> Self {
        Self::new(config.minimum_free_entry_size)
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn minimum_free_entry_size(&self) -> usize {
        self.minimum_free_entry_size
    }

    pub fn base(&self) -> Address {
        self.managed.low
    }

    pub fn managed_range(&self) -> AddressRange {
        self.managed
    }

    /// Where the next object will be allocated. Contents between here and
    /// `top_pointer()` are undefined.
    pub fn allocation_pointer(&self) -> Address {
        self.allocate_pointer
    }

    pub fn top_pointer(&self) -> Address {
        self.top_pointer
    }

    /// Bytes left in the bump window. Free-list memory is not counted.
    pub fn allocatable_bytes(&self) -> usize {
        self.top_pointer.distance_from(self.allocate_pointer)
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn free_entries(&self) -> &[FreeEntry] {
        self.free_list.entries()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn last_free_entry(&self) -> Option<FreeEntryId> {
        self.last_free_entry
    }

    pub fn set_last_free_entry(&mut self, entry: Option<FreeEntryId>) {
        self.last_free_entry = entry;
    }

    /// Free memory as the heap sizing logic should see it.
    ///
    /// A sweep does not see a tail smaller than the floor, so the linked
    /// free bytes can trail the bump window. Take whichever is larger.
    pub fn free_memory_and_dark_matter_bytes(&self) -> usize {
        let swept = self.stats.free_memory_bytes + self.stats.dark_matter_bytes;
        swept.max(self.allocatable_bytes())
    }

    // ── Allocation fast path ─────────────────────────────────────────────

    /// Bump-allocate `size` bytes.
    ///
    /// Returns the old allocation pointer, or `None` if the bump window is
    /// too small. `None` is the normal signal to collect or expand; the
    /// pool is unchanged.
    #[inline]
    pub fn allocate_object(&mut self, size: usize) -> Option<Address> {
        if self.allocatable_bytes() < size {
            trace!(
                target: "mesh_gc::pool",
                size,
                available = self.allocatable_bytes(),
                "object allocation failed"
            );
            return None;
        }
        let address = self.allocate_pointer;
        self.allocate_pointer = address.offset(size);
        self.last_free_entry = None;
        self.stats.allocation_count += 1;
        self.stats.allocated_bytes += size;
        Some(address)
    }

    /// Allocate a thread-local heap of up to `max_size` bytes.
    ///
    /// Grants whatever is left if that is less than `max_size`. Once less
    /// than the free entry floor remains, the window is treated as used up.
    pub fn allocate_tlh(&mut self, max_size: usize) -> Option<AddressRange> {
        let available = self.allocatable_bytes();
        if max_size == 0 || available < self.minimum_free_entry_size {
            trace!(
                target: "mesh_gc::pool",
                max_size,
                available,
                "TLH allocation failed"
            );
            return None;
        }
        let size = max_size.min(available);
        let range = AddressRange::with_size(self.allocate_pointer, size);
        self.allocate_pointer = range.high;
        self.last_free_entry = None;
        self.stats.allocation_count += 1;
        self.stats.allocated_bytes += size;
        Some(range)
    }

    /// Object allocation on behalf of the collector, e.g. to copy a
    /// survivor.
    ///
    /// `&mut self` already gives exclusive access, so `locking_required`
    /// only shows up in trace output.
    pub fn collector_allocate(&mut self, size: usize, locking_required: bool) -> Option<Address> {
        trace!(target: "mesh_gc::pool", size, locking_required, "collector allocation");
        let address = self.allocate_object(size)?;
        self.stats.collector_allocation_count += 1;
        Some(address)
    }

    /// TLH allocation on behalf of the collector. See `collector_allocate`.
    pub fn collector_allocate_tlh(
        &mut self,
        max_size: usize,
        locking_required: bool,
    ) -> Option<AddressRange> {
        trace!(target: "mesh_gc::pool", max_size, locking_required, "collector TLH allocation");
        let range = self.allocate_tlh(max_size)?;
        self.stats.collector_allocation_count += 1;
        Some(range)
    }

    // ── Allocation pointer management ────────────────────────────────────

    /// Move the allocation pointer back toward the base, e.g. to undo a
    /// speculative reservation so its tail can be refilled.
    ///
    /// Moving it forward would hand already-granted memory back out, so it
    /// is rejected.
    pub fn rewind_allocation_pointer_to(&mut self, pointer: Address) -> Result<(), PoolError> {
        if pointer > self.allocate_pointer {
            error!(
                target: "mesh_gc::pool",
                current = %self.allocate_pointer,
                requested = %pointer,
                "refusing to rewind allocation pointer forward"
            );
            return Err(PoolError::RewindForward {
                current: self.allocate_pointer,
                requested: pointer,
            });
        }
        if pointer < self.managed.low {
            return Err(PoolError::OutOfRange {
                address: pointer,
                range: self.managed,
            });
        }
        self.allocate_pointer = pointer;
        Ok(())
    }

    /// Set the allocation pointer after a compaction has rearranged the
    /// objects in the pool. Any value inside the bump range is accepted.
    pub fn set_allocation_pointer(&mut self, pointer: Address) -> Result<(), PoolError> {
        if pointer < self.managed.low || pointer > self.top_pointer {
            return Err(PoolError::OutOfRange {
                address: pointer,
                range: self.managed,
            });
        }
        self.allocate_pointer = pointer;
        self.last_free_entry = None;
        Ok(())
    }

    /// Round the allocation pointer up to a multiple of `alignment`.
    ///
    /// The skipped bytes become dark matter. If the aligned pointer would
    /// pass the top, the pool is left exhausted instead.
    pub fn align_allocation_pointer(&mut self, alignment: usize) -> Result<(), PoolError> {
        if !alignment.is_power_of_two() {
            return Err(PoolError::BadAlignment(alignment));
        }
        let aligned = self.allocate_pointer.align_up(alignment).min(self.top_pointer);
        self.stats.dark_matter_bytes += aligned.distance_from(self.allocate_pointer);
        self.allocate_pointer = aligned;
        Ok(())
    }

    // ── Reset / sweep ────────────────────────────────────────────────────

    /// Void the pool's contents: the whole managed range becomes the bump
    /// window and the free list is discarded.
    pub fn reset(&mut self, cause: ResetCause) {
        debug!(
            target: "mesh_gc::pool",
            ?cause,
            range = ?self.managed,
            "resetting pool"
        );
        self.allocate_pointer = self.managed.low;
        self.top_pointer = self.managed.high;
        self.free_list.clear();
        self.last_free_entry = None;
        self.stats = PoolStats::default();
    }

    /// Link the dead spans of a swept `region` into the free list after
    /// `previous`, returning the new tail.
    ///
    /// `previous == None` starts a fresh list for a new sweep. Otherwise
    /// everything after `previous` is dropped, so calling this region by
    /// region in ascending order builds one ordered list. Spans below the
    /// floor are counted as dark matter. If the region links nothing,
    /// `previous` is returned.
    ///
    /// The region must lie inside the managed range. Any part of the bump
    /// window inside it is retired, so free entries never overlap the
    /// window; `connect_final_memory_to_pool` opens a new one.
    pub fn rebuild_free_list_in_region(
        &mut self,
        region: &HeapRegion,
        previous: Option<FreeEntryId>,
    ) -> Result<Option<FreeEntryId>, PoolError> {
        region.validate()?;
        if !self.managed.encloses(&region.range()) {
            error!(
                target: "mesh_gc::pool",
                region = ?region.range(),
                managed = ?self.managed,
                "swept region is outside the pool"
            );
            return Err(PoolError::OutOfRange {
                address: region.low(),
                range: self.managed,
            });
        }
        if let Some(id) = previous {
            let entry = self
                .free_list
                .get(id)
                .ok_or(PoolError::UnknownFreeEntry(id.index()))?;
            if entry.end() > region.low() {
                return Err(PoolError::MalformedRegion {
                    region: region.range(),
                    reason: "region starts below the previous free entry",
                });
            }
        } else {
            self.stats.dark_matter_bytes = 0;
        }

        self.retire_window_over(&region.range());
        self.free_list.truncate_after(previous);

        let mut tail = previous;
        let mut linked = 0usize;
        let mut dark = 0usize;
        for span in region.dead_spans() {
            if self.can_memory_be_connected_to_pool(span.size()) {
                tail = Some(self.free_list.push(FreeEntry::new(span.low, span.size())));
                linked += span.size();
            } else {
                dark += span.size();
            }
        }

        self.stats.dark_matter_bytes += dark;
        self.recalculate_statistics();
        self.last_free_entry = tail;

        debug!(
            target: "mesh_gc::pool",
            region = ?region.range(),
            live = region.live_bytes(),
            linked,
            dark,
            entries = self.free_list.len(),
            "rebuilt free list for region"
        );
        Ok(tail)
    }

    /// Link a free span found between live objects after `previous`.
    ///
    /// Returns the new entry, or `None` if the span was below the floor and
    /// became dark matter.
    pub fn connect_inner_memory_to_pool(
        &mut self,
        address: Address,
        size: usize,
        previous: Option<FreeEntryId>,
    ) -> Result<Option<FreeEntryId>, PoolError> {
        let range = AddressRange::with_size(address, size);
        if range.is_empty() {
            return Ok(None);
        }
        self.check_free_candidate(&range)?;
        if let Some(id) = previous {
            let entry = self
                .free_list
                .get(id)
                .ok_or(PoolError::UnknownFreeEntry(id.index()))?;
            if entry.end() > range.low {
                return Err(PoolError::OutOfOrder {
                    range,
                    entry: entry.range(),
                });
            }
        }
        self.recycle_heap_chunk(range)
    }

    /// Link the free span that leads a chunk, in front of `next`.
    ///
    /// Returns the new entry, or `None` if the span became dark matter.
    pub fn connect_outer_memory_to_pool(
        &mut self,
        address: Address,
        size: usize,
        next: Option<FreeEntryId>,
    ) -> Result<Option<FreeEntryId>, PoolError> {
        let range = AddressRange::with_size(address, size);
        if range.is_empty() {
            return Ok(None);
        }
        self.check_free_candidate(&range)?;
        if let Some(id) = next {
            let entry = self
                .free_list
                .get(id)
                .ok_or(PoolError::UnknownFreeEntry(id.index()))?;
            if entry.start < range.high {
                return Err(PoolError::OutOfOrder {
                    range,
                    entry: entry.range(),
                });
            }
        }
        self.recycle_heap_chunk(range)
    }

    /// Turn the sweep's final free span into the bump window so the
    /// allocation that triggered the collection can be retried.
    pub fn connect_final_memory_to_pool(
        &mut self,
        address: Address,
        size: usize,
    ) -> Result<(), PoolError> {
        let range = AddressRange::with_size(address, size);
        if !self.managed.encloses(&range) {
            return Err(PoolError::OutOfRange {
                address,
                range: self.managed,
            });
        }
        if let Some(id) = self.free_list.find_enclosing(&range) {
            let dropped = self
                .free_list
                .carve(id, &range, self.minimum_free_entry_size);
            self.stats.dark_matter_bytes += dropped;
            self.recalculate_statistics();
            self.last_free_entry = self.free_list.tail();
        }
        self.allocate_pointer = range.low;
        self.top_pointer = range.high;
        Ok(())
    }

    /// Scan the free list for the last entry no larger than `region_size`.
    ///
    /// The list is ordered by address, not size, so the first oversized
    /// entry ends the scan with `None`.
    pub fn find_last_free_entry(&self, region_size: usize) -> Option<FreeEntryId> {
        let mut last = None;
        for (id, entry) in self.free_list.iter() {
            if entry.size > region_size {
                return None;
            }
            last = Some(id);
        }
        last
    }

    /// Record `[low, high)` as free. It is linked if it meets the floor and
    /// abandoned as dark matter otherwise. Returns whether it was linked.
    ///
    /// The range must lie outside the bump window and must not overlap an
    /// entry already on the free list.
    pub fn create_free_entry(&mut self, low: Address, high: Address) -> Result<bool, PoolError> {
        let range = checked_range(low, high)?;
        if range.is_empty() {
            return Ok(false);
        }
        self.check_free_candidate(&range)?;
        Ok(self.recycle_heap_chunk(range)?.is_some())
    }

    /// Whether a free span of `size` bytes is worth linking.
    #[inline]
    pub fn can_memory_be_connected_to_pool(&self, size: usize) -> bool {
        size >= self.minimum_free_entry_size
    }

    /// Give up on `[low, high)`: it is counted as dark matter.
    pub fn abandon_heap_chunk(&mut self, low: Address, high: Address) -> Result<(), PoolError> {
        let range = checked_range(low, high)?;
        self.stats.dark_matter_bytes += range.size();
        Ok(())
    }

    /// Recompute the free-list figures by walking the list.
    pub fn recalculate_statistics(&mut self) {
        self.stats.free_memory_bytes = self.free_list.total_bytes();
        self.stats.free_entry_count = self.free_list.len();
        self.stats.largest_free_entry = self.free_list.largest();
    }

    // ── Expand / contract ────────────────────────────────────────────────

    /// Add `[low, high)` to the managed range.
    ///
    /// The range must touch one end of the managed range, unless the pool
    /// is empty. With `can_coalesce` an upward extension is merged into
    /// the bump window when the window reaches the top, and a downward one
    /// when nothing has been allocated. Otherwise the new memory is linked
    /// as a free entry. Either way the pool gains exactly `size` bytes.
    pub fn expand_with_range(
        &mut self,
        size: usize,
        low: Address,
        high: Address,
        can_coalesce: bool,
    ) -> Result<(), PoolError> {
        let range = checked_range(low, high)?;
        if range.size() != size {
            return Err(PoolError::SizeMismatch { size, range });
        }
        if range.is_empty() {
            return Ok(());
        }

        if self.managed.is_empty() {
            self.managed = range;
            self.allocate_pointer = low;
            self.top_pointer = high;
        } else if low == self.managed.high {
            if can_coalesce && self.top_pointer == self.managed.high {
                self.top_pointer = high;
            } else {
                self.recycle_heap_chunk(range)?;
            }
            self.managed.high = high;
        } else if high == self.managed.low {
            if can_coalesce && self.allocate_pointer == self.managed.low {
                self.allocate_pointer = low;
            } else {
                self.recycle_heap_chunk(range)?;
            }
            self.managed.low = low;
        } else {
            return Err(PoolError::NotAdjacent {
                range,
                managed: self.managed,
            });
        }

        self.last_free_entry = None;
        debug!(
            target: "mesh_gc::pool",
            added = ?range,
            managed = ?self.managed,
            can_coalesce,
            "expanded pool"
        );
        Ok(())
    }

    /// Remove `[low, high)` from one end of the managed range.
    ///
    /// The range must be entirely free, either inside the bump window or
    /// inside a single free entry. Returns the low address of the removed
    /// range.
    pub fn contract_with_range(
        &mut self,
        size: usize,
        low: Address,
        high: Address,
    ) -> Result<Address, PoolError> {
        let range = checked_range(low, high)?;
        if range.size() != size {
            return Err(PoolError::SizeMismatch { size, range });
        }
        if range.is_empty() {
            return Ok(low);
        }
        if !self.managed.encloses(&range) {
            return Err(PoolError::OutOfRange {
                address: low,
                range: self.managed,
            });
        }
        let at_top = high == self.managed.high;
        let at_bottom = low == self.managed.low;
        if !at_top && !at_bottom {
            return Err(PoolError::NotAdjacent {
                range,
                managed: self.managed,
            });
        }

        let window = AddressRange::new(self.allocate_pointer, self.top_pointer);
        if window.encloses(&range) {
            if at_top {
                self.top_pointer = low;
            } else {
                self.allocate_pointer = high;
            }
        } else if let Some(id) = self.free_list.find_enclosing(&range) {
            let dropped = self
                .free_list
                .carve(id, &range, self.minimum_free_entry_size);
            self.stats.dark_matter_bytes += dropped;
            self.recalculate_statistics();
        } else {
            return Err(PoolError::RangeInUse { range });
        }

        if at_top {
            self.managed.high = low;
        } else {
            self.managed.low = high;
        }
        self.top_pointer = self.top_pointer.min(self.managed.high);
        self.allocate_pointer = self
            .allocate_pointer
            .max(self.managed.low)
            .min(self.top_pointer);
        self.last_free_entry = None;

        debug!(
            target: "mesh_gc::pool",
            removed = ?range,
            managed = ?self.managed,
            "contracted pool"
        );
        Ok(low)
    }

    /// A free chunk must be inside the pool and clear of the bump window.
    fn check_free_candidate(&self, range: &AddressRange) -> Result<(), PoolError> {
        if !self.managed.encloses(range) {
            return Err(PoolError::OutOfRange {
                address: range.low,
                range: self.managed,
            });
        }
        let window = AddressRange::new(self.allocate_pointer, self.top_pointer);
        if window.overlaps(range) {
            return Err(PoolError::RangeInUse { range: *range });
        }
        Ok(())
    }

    /// Link a non-empty free chunk, or count it as dark matter if it is
    /// below the floor. Overlap with a linked entry is rejected either way.
    fn recycle_heap_chunk(
        &mut self,
        range: AddressRange,
    ) -> Result<Option<FreeEntryId>, PoolError> {
        if let Some(id) = self.free_list.find_overlapping(&range) {
            error!(
                target: "mesh_gc::pool",
                chunk = ?range,
                entry = ?self.free_list.get(id).map(FreeEntry::range),
                "free chunk overlaps a linked entry"
            );
            return Err(PoolError::RangeInUse { range });
        }
        if !self.can_memory_be_connected_to_pool(range.size()) {
            self.stats.dark_matter_bytes += range.size();
            return Ok(None);
        }
        let id = self
            .free_list
            .insert_sorted(FreeEntry::new(range.low, range.size()))
            .map_err(|_| PoolError::RangeInUse { range })?;
        self.recalculate_statistics();
        if self.last_free_entry.is_some() {
            self.last_free_entry = self.free_list.tail();
        }
        Ok(Some(id))
    }

    /// A sweep owns its region, so the part of the bump window inside it
    /// is dropped. A window that starts below the region is cut at the
    /// region's low end; otherwise it restarts at the region's high end.
    fn retire_window_over(&mut self, region: &AddressRange) {
        let window = AddressRange::new(self.allocate_pointer, self.top_pointer);
        if !window.overlaps(region) {
            return;
        }
        if self.allocate_pointer < region.low {
            self.top_pointer = region.low;
        } else {
            self.allocate_pointer = region.high.min(self.top_pointer);
        }
        trace!(
            target: "mesh_gc::pool",
            region = ?region,
            allocate_pointer = %self.allocate_pointer,
            top_pointer = %self.top_pointer,
            "retired bump window over swept region"
        );
    }
}

fn checked_range(low: Address, high: Address) -> Result<AddressRange, PoolError> {
    if high < low {
        return Err(PoolError::InvertedRange { low, high });
    }
    Ok(AddressRange::new(low, high))
}

impl fmt::Debug for BumpPointerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpPointerPool")
            .field("managed", &self.managed)
            .field("allocate_pointer", &self.allocate_pointer)
            .field("top_pointer", &self.top_pointer)
            .field("free_entries", &self.free_list.len())
            .field("minimum_free_entry_size", &self.minimum_free_entry_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

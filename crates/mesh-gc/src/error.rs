//! Error types for the pool and the main GC thread driver.
//!
//! Running out of pool space is not an error: allocation returns `None` and
//! the caller escalates to a collection. The types here cover setup
//! failures, contract violations, and faults reported by the collector.

use std::io;

use thiserror::Error;

use crate::address::{Address, AddressRange};
use crate::driver::DriverState;

/// A rejected pool operation. The pool is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The allocation pointer may only move toward the pool base.
    #[error("cannot rewind allocation pointer forward from {current} to {requested}")]
    RewindForward { current: Address, requested: Address },

    /// An address fell outside the range the pool manages.
    #[error("address {address} is outside the managed range {range:?}")]
    OutOfRange { address: Address, range: AddressRange },

    /// An expansion range does not touch the current managed range.
    #[error("range {range:?} is not adjacent to the managed range {managed:?}")]
    NotAdjacent {
        range: AddressRange,
        managed: AddressRange,
    },

    /// The size argument disagrees with the `[low, high)` bounds.
    #[error("size {size} does not match range {range:?}")]
    SizeMismatch { size: usize, range: AddressRange },

    /// `high` was below `low`.
    #[error("inverted range {low}..{high}")]
    InvertedRange { low: Address, high: Address },

    /// A contraction would remove memory that is not known to be free, or
    /// a new free chunk overlaps the bump window or a linked entry.
    #[error("range {range:?} overlaps memory the pool already accounts for")]
    RangeInUse { range: AddressRange },

    /// A connected span does not sit on the expected side of its
    /// neighbouring free entry.
    #[error("range {range:?} is out of address order with free entry {entry:?}")]
    OutOfOrder {
        range: AddressRange,
        entry: AddressRange,
    },

    /// The sweep handed over a region whose live spans are unsorted,
    /// overlapping, or outside the region.
    #[error("malformed heap region {region:?}: {reason}")]
    MalformedRegion {
        region: AddressRange,
        reason: &'static str,
    },

    /// A free-list position that does not exist (stale after a rebuild).
    #[error("free entry #{0} does not exist")]
    UnknownFreeEntry(usize),

    /// Alignment must be a non-zero power of two.
    #[error("alignment {0} is not a power of two")]
    BadAlignment(usize),
}

/// A failure of the driver lifecycle (initialize / startup / shutdown).
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("main GC thread driver is already initialized (state {0})")]
    AlreadyInitialized(DriverState),

    #[error("main GC thread driver is not initialized")]
    NotInitialized,

    #[error("main GC thread was already started (state {0})")]
    AlreadyStarted(DriverState),

    /// The host refused to create the main GC thread.
    #[error("failed to spawn main GC thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// The worker reported `Error` before reaching `Waiting`.
    #[error("main GC thread failed to start")]
    StartupFailed,

    /// `shutdown()` without a successful `startup()`.
    #[error("main GC thread is not running (state {0})")]
    NotRunning(DriverState),
}

/// A fault raised by the collector while running a cycle.
///
/// The driver logs and counts it, then returns to `Waiting`. Recovering
/// the heap is the collector's job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("collector fault: {message}")]
pub struct CollectorFault {
    pub message: String,
}

impl CollectorFault {
    pub fn new(message: impl Into<String>) -> Self {
        CollectorFault {
            message: message.into(),
        }
    }
}

//! Per-thread GC environment and the descriptors a mutator hands to the
//! driver when it asks for a collection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// GcEnv
// ---------------------------------------------------------------------------

/// Which role a thread plays with respect to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// A thread running managed code and allocating.
    Mutator,
    /// The dedicated thread that drives collection cycles.
    MainGc,
}

/// The environment a thread carries into every GC entry point.
///
/// One per thread, never shared. The driver only reads it.
#[derive(Clone)]
pub struct GcEnv {
    id: u64,
    kind: ThreadKind,
    name: String,
    cycle_state: CycleState,
}

impl GcEnv {
    fn new(kind: ThreadKind, name: String) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        GcEnv {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name,
            cycle_state: CycleState::default(),
        }
    }

    /// Environment for a mutator thread.
    pub fn mutator(name: impl Into<String>) -> Self {
        Self::new(ThreadKind::Mutator, name.into())
    }

    /// Environment for the main GC thread (or an implicit caller acting as it).
    pub fn main_gc_thread(name: impl Into<String>) -> Self {
        Self::new(ThreadKind::MainGc, name.into())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cycle state this thread wants the next collection to use.
    pub fn cycle_state(&self) -> &CycleState {
        &self.cycle_state
    }

    pub fn set_cycle_state(&mut self, cycle_state: CycleState) {
        self.cycle_state = cycle_state;
    }
}

impl fmt::Debug for GcEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcEnv")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CycleState
// ---------------------------------------------------------------------------

/// The scope of a requested collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleType {
    /// Whole-heap mark and sweep.
    #[default]
    Global,
    /// A partial collection of part of the heap.
    Local,
}

/// Describes the cycle a requester wants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleState {
    pub cycle_type: CycleType,
    /// Requested by the program (e.g. an explicit `gc()` call) rather than
    /// by an allocation failure.
    pub explicit: bool,
}

impl CycleState {
    pub fn global() -> Self {
        CycleState {
            cycle_type: CycleType::Global,
            explicit: false,
        }
    }

    pub fn explicit_global() -> Self {
        CycleState {
            cycle_type: CycleType::Global,
            explicit: true,
        }
    }
}

// ---------------------------------------------------------------------------
// AllocateDescription
// ---------------------------------------------------------------------------

/// The allocation failure that triggered a collection request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocateDescription {
    /// Bytes the mutator was trying to allocate.
    pub bytes_requested: usize,
    /// True if the failed request was for a thread-local heap.
    pub tlh_allocation: bool,
}

impl AllocateDescription {
    pub fn object(bytes_requested: usize) -> Self {
        AllocateDescription {
            bytes_requested,
            tlh_allocation: false,
        }
    }

    pub fn tlh(bytes_requested: usize) -> Self {
        AllocateDescription {
            bytes_requested,
            tlh_allocation: true,
        }
    }
}

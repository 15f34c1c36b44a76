//! Mesh GC core.
//!
//! The part of the mark-and-sweep collector that sits between mutators and
//! the collection algorithm. Marking, sweeping, and the region manager are
//! supplied by the runtime through traits and descriptors.
//!
//! ## Modules
//!
//! - [`driver`]: the main GC thread. Serializes collection requests from
//!   mutator threads and runs stop-the-world or concurrent cycles.
//! - [`pool`]: bump-pointer memory pool with a free list rebuilt after
//!   every sweep.
//! - [`region`]: swept heap region descriptors consumed by the pool.
//! - [`env`]: per-thread GC environment and request descriptors.
//! - [`config`]: `GcConfig`, from TOML or `MESH_GC_*` environment variables.
//! - [`address`]: address and range newtypes.
//! - [`error`]: error types.
//!
//! Logging goes through `tracing` under the `mesh_gc::driver` and
//! `mesh_gc::pool` targets. The crate installs no subscriber.

pub mod address;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod pool;
pub mod region;

pub use address::{Address, AddressRange};
pub use config::{ConfigError, GcConfig};
pub use driver::{
    CollectionRequest, Collector, CollectorDriver, ConcurrentOutcome, DriverOptions, DriverState,
    DriverStats, NoVmAccess, OsThreadSpawner, ThreadSpawner, VmAccess,
};
pub use env::{AllocateDescription, CycleState, CycleType, GcEnv, ThreadKind};
pub use error::{CollectorFault, DriverError, PoolError};
pub use pool::{BumpPointerPool, FreeEntry, FreeEntryId, PoolStats, ResetCause};
pub use region::HeapRegion;

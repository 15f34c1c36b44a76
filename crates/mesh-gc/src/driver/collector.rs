//! The seams between the driver and the rest of the runtime.
//!
//! The driver does not know how to mark or sweep. It calls into a
//! `Collector` for the cycle body and into `VmAccess` to stop or share the
//! world around it.

use crate::env::GcEnv;
use crate::error::CollectorFault;

use super::CollectionRequest;

/// How a concurrent phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentOutcome {
    /// The phase finished its work.
    Completed,
    /// The phase stopped early after `request_concurrent_pause`. Its
    /// progress is kept and the next `concurrent_collect` continues it.
    Suspended,
}

/// The collection logic the driver runs on behalf of mutators.
///
/// All methods run on the main GC thread, or on the requesting thread in
/// implicit mode. A panic inside any of them is caught and treated as a
/// `CollectorFault`.
pub trait Collector: Send + Sync {
    /// Run a full stop-the-world cycle. Called with exclusive VM access.
    fn stop_the_world_collect(
        &self,
        env: &GcEnv,
        request: &CollectionRequest,
    ) -> Result<(), CollectorFault>;

    /// Run (or continue) the concurrent phase. `request` is `None` when the
    /// driver runs it in the background without a requester.
    fn concurrent_collect(
        &self,
        env: &GcEnv,
        request: Option<&CollectionRequest>,
    ) -> Result<ConcurrentOutcome, CollectorFault>;

    /// Whether the next cycle should go down the concurrent path.
    fn is_concurrent_work_available(&self, env: &GcEnv) -> bool;

    /// Ask a running concurrent phase to stop at its next safe point and
    /// return `Suspended`. Called with the driver's control lock held, so
    /// it must only set a flag.
    fn request_concurrent_pause(&self) {}
}

/// Host control over mutator threads.
pub trait VmAccess: Send + Sync {
    /// Stop every mutator. Returns once the world is stopped.
    fn acquire_exclusive(&self, env: &GcEnv);
    fn release_exclusive(&self, env: &GcEnv);
    /// Register as a VM participant while mutators keep running.
    fn acquire_shared(&self, env: &GcEnv);
    fn release_shared(&self, env: &GcEnv);
}

/// `VmAccess` for hosts that have no mutators to stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVmAccess;

impl VmAccess for NoVmAccess {
    fn acquire_exclusive(&self, _env: &GcEnv) {}
    fn release_exclusive(&self, _env: &GcEnv) {}
    fn acquire_shared(&self, _env: &GcEnv) {}
    fn release_shared(&self, _env: &GcEnv) {}
}

/// Exclusive VM access, released on drop (including during unwinding).
pub(crate) struct ExclusiveAccess<'a> {
    vm: &'a dyn VmAccess,
    env: &'a GcEnv,
}

impl<'a> ExclusiveAccess<'a> {
    pub(crate) fn acquire(vm: &'a dyn VmAccess, env: &'a GcEnv) -> Self {
        vm.acquire_exclusive(env);
        ExclusiveAccess { vm, env }
    }
}

impl Drop for ExclusiveAccess<'_> {
    fn drop(&mut self) {
        self.vm.release_exclusive(self.env);
    }
}

/// Shared VM access, released on drop.
pub(crate) struct SharedAccess<'a> {
    vm: &'a dyn VmAccess,
    env: &'a GcEnv,
}

impl<'a> SharedAccess<'a> {
    pub(crate) fn acquire(vm: &'a dyn VmAccess, env: &'a GcEnv) -> Self {
        vm.acquire_shared(env);
        SharedAccess { vm, env }
    }
}

impl Drop for SharedAccess<'_> {
    fn drop(&mut self) {
        self.vm.release_shared(self.env);
    }
}

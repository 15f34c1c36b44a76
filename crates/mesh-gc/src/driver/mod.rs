//! Main GC thread driver.
//!
//! Mutators never run a collection themselves. They call
//! [`CollectorDriver::garbage_collect`], which hands the request to one
//! dedicated thread and blocks until that cycle is done. The driver owns the
//! state machine in [`DriverState`]; the cycle body belongs to a
//! [`Collector`].
//!
//! ## Synchronization
//!
//! - A `parking_lot::Mutex<Control>` with one `Condvar` guards the state and
//!   the cycle counters. Every state change goes through `Inner::set_state`,
//!   which also publishes an atomic snapshot and wakes all waiters.
//! - Requests travel to the worker over a `crossbeam_channel::bounded(1)`
//!   queue. A requester only sends after observing `Waiting`, so at most one
//!   request is ever queued.
//! - The control lock is released while collection work runs. Requesters
//!   arriving mid-cycle wait on the condvar for `Waiting`.
//! - Collection bodies run under `catch_unwind`. A panic or a
//!   `CollectorFault` is logged and counted and the state still returns to
//!   `Waiting`, so no requester is left blocked.
//!
//! In implicit mode there is no worker thread: the requester runs the cycle
//! inline under the same state discipline.

pub mod collector;
pub mod spawn;
pub mod state;

pub use collector::{Collector, ConcurrentOutcome, NoVmAccess, VmAccess};
pub use spawn::{OsThreadSpawner, ThreadBody, ThreadSpawner};
pub use state::DriverState;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::GcConfig;
use crate::env::{AllocateDescription, CycleState, GcEnv};
use crate::error::{CollectorFault, DriverError};

use collector::{ExclusiveAccess, SharedAccess};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What a requester hands to the main GC thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRequest {
    pub cycle_state: CycleState,
    /// The failed allocation that prompted the request, if any.
    pub allocate_description: Option<AllocateDescription>,
    /// Sequence number of the cycle serving this request, starting at 1.
    pub cycle_id: u64,
}

/// Driver settings, usually taken from a [`GcConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    /// Run cycles on the requesting thread instead of a worker.
    pub run_as_implicit: bool,
    /// Hold shared VM access for the duration of a concurrent phase.
    pub acquire_vm_access_during_concurrent: bool,
    /// Let requesters pause a background concurrent phase, which the
    /// worker resumes later.
    pub concurrent_resumable: bool,
    pub thread_name: String,
    pub stack_size: Option<usize>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions::from(&GcConfig::default())
    }
}

impl From<&GcConfig> for DriverOptions {
    fn from(config: &GcConfig) -> Self {
        DriverOptions {
            run_as_implicit: config.run_as_implicit,
            acquire_vm_access_during_concurrent: config.acquire_vm_access_during_concurrent,
            concurrent_resumable: config.concurrent_resumable,
            thread_name: config.main_thread_name.clone(),
            stack_size: config.main_thread_stack_size,
        }
    }
}

/// Counters kept by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    /// Requests served to completion.
    pub cycles_completed: u64,
    pub stw_cycles: u64,
    /// Concurrent phases run, request-driven or background.
    pub concurrent_phases: u64,
    pub concurrent_suspensions: u64,
    /// Faults and panics contained by the driver.
    pub collector_faults: u64,
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

enum DriverMessage {
    Collect(CollectionRequest),
    Terminate,
}

struct Control {
    state: DriverState,
    next_cycle_id: u64,
    completed_cycle_id: u64,
    /// Threads blocked until `Waiting`. Background work does not start
    /// while any are present.
    waiters: usize,
    /// The running concurrent phase was started by a request.
    serving_request: bool,
    pause_requested: bool,
    /// The last concurrent phase was suspended and has work left.
    suspended: bool,
    stats: DriverStats,
}

/// Collaborators fixed by `initialize`.
struct Wiring {
    collector: Arc<dyn Collector>,
    vm_access: Arc<dyn VmAccess>,
    options: DriverOptions,
    sender: Sender<DriverMessage>,
}

struct Inner {
    control: Mutex<Control>,
    cond: Condvar,
    /// Mirror of `Control::state` for lock-free reads.
    snapshot: AtomicU8,
    wiring: OnceLock<Wiring>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            control: Mutex::new(Control {
                state: DriverState::Disabled,
                next_cycle_id: 1,
                completed_cycle_id: 0,
                waiters: 0,
                serving_request: false,
                pause_requested: false,
                suspended: false,
                stats: DriverStats::default(),
            }),
            cond: Condvar::new(),
            snapshot: AtomicU8::new(DriverState::Disabled.as_u8()),
            wiring: OnceLock::new(),
        }
    }

    fn state(&self) -> DriverState {
        DriverState::from_u8(self.snapshot.load(Ordering::Acquire))
    }

    /// The only writer of the state. Requires the control lock.
    fn set_state(&self, control: &mut Control, state: DriverState) {
        control.state = state;
        self.snapshot.store(state.as_u8(), Ordering::Release);
        self.cond.notify_all();
    }

    /// Block until the driver is `Waiting`. Returns false if it stops
    /// running instead.
    ///
    /// With `pause` set and a resumable configuration, a background
    /// concurrent phase is asked to pause so the caller is not held up by
    /// work nobody requested.
    fn wait_until_idle(
        &self,
        control: &mut MutexGuard<'_, Control>,
        wiring: &Wiring,
        pause: bool,
    ) -> bool {
        control.waiters += 1;
        let mut slot = WaiterSlot { control };
        loop {
            let state = slot.control.state;
            match state {
                DriverState::Waiting => return true,
                DriverState::GcRequested | DriverState::RunningConcurrent => {
                    if pause
                        && wiring.options.concurrent_resumable
                        && state == DriverState::RunningConcurrent
                        && !slot.control.serving_request
                        && !slot.control.pause_requested
                    {
                        slot.control.pause_requested = true;
                        debug!(target: "mesh_gc::driver", "pausing background concurrent phase");
                        let paused = guarded(|| {
                            wiring.collector.request_concurrent_pause();
                            Ok(())
                        });
                        if let Err(fault) = paused {
                            self.record_fault(&mut *slot.control, "pause request", &fault);
                        }
                    }
                    self.cond.wait(&mut *slot.control);
                }
                _ => return false,
            }
        }
    }

    /// Run one requested cycle. Entered and left with the lock held and
    /// the state at `GcRequested`; leaves the state at `Waiting`.
    fn serve(
        &self,
        control: &mut MutexGuard<'_, Control>,
        wiring: &Wiring,
        env: &GcEnv,
        request: &CollectionRequest,
    ) {
        let concurrent =
            MutexGuard::unlocked(control, || self.concurrent_work_available(wiring, env));
        if concurrent {
            control.serving_request = true;
            self.handle_concurrent(control, wiring, env, Some(request));
            control.serving_request = false;
        } else {
            self.handle_stw(control, wiring, env, request);
        }
        control.completed_cycle_id = request.cycle_id;
        control.stats.cycles_completed += 1;
        self.set_state(control, DriverState::Waiting);
    }

    /// Stop the world and collect.
    fn handle_stw(
        &self,
        control: &mut MutexGuard<'_, Control>,
        wiring: &Wiring,
        env: &GcEnv,
        request: &CollectionRequest,
    ) {
        debug!(target: "mesh_gc::driver", cycle = request.cycle_id, "stop-the-world collection");
        let result = MutexGuard::unlocked(control, || {
            guarded(|| {
                let _access = ExclusiveAccess::acquire(wiring.vm_access.as_ref(), env);
                wiring.collector.stop_the_world_collect(env, request)
            })
        });
        control.stats.stw_cycles += 1;
        if let Err(fault) = result {
            self.record_fault(control, "stop-the-world", &fault);
        }
    }

    /// Run (or resume) the concurrent phase. The caller restores `Waiting`.
    fn handle_concurrent(
        &self,
        control: &mut MutexGuard<'_, Control>,
        wiring: &Wiring,
        env: &GcEnv,
        request: Option<&CollectionRequest>,
    ) {
        self.set_state(control, DriverState::RunningConcurrent);
        debug!(
            target: "mesh_gc::driver",
            cycle = ?request.map(|r| r.cycle_id),
            resuming = control.suspended,
            "concurrent phase"
        );
        let result = MutexGuard::unlocked(control, || {
            guarded(|| {
                let _access = wiring
                    .options
                    .acquire_vm_access_during_concurrent
                    .then(|| SharedAccess::acquire(wiring.vm_access.as_ref(), env));
                wiring.collector.concurrent_collect(env, request)
            })
        });
        control.stats.concurrent_phases += 1;
        control.pause_requested = false;
        match result {
            Ok(ConcurrentOutcome::Completed) => control.suspended = false,
            Ok(ConcurrentOutcome::Suspended) => {
                control.suspended = true;
                control.stats.concurrent_suspensions += 1;
                debug!(target: "mesh_gc::driver", "concurrent phase suspended");
            }
            Err(fault) => {
                control.suspended = false;
                self.record_fault(control, "concurrent", &fault);
            }
        }
    }

    fn concurrent_work_available(&self, wiring: &Wiring, env: &GcEnv) -> bool {
        match guarded(|| Ok(wiring.collector.is_concurrent_work_available(env))) {
            Ok(available) => available,
            Err(fault) => {
                self.record_fault(&mut self.control.lock(), "work query", &fault);
                false
            }
        }
    }

    /// Background work runs only when idle with nobody queued behind it.
    fn background_work_available(&self, wiring: &Wiring, env: &GcEnv) -> bool {
        {
            let control = self.control.lock();
            if control.state != DriverState::Waiting || control.waiters > 0 {
                return false;
            }
        }
        self.concurrent_work_available(wiring, env)
    }

    fn run_background_phase(&self, wiring: &Wiring, env: &GcEnv) {
        let mut control = self.control.lock();
        if control.state != DriverState::Waiting || control.waiters > 0 {
            return;
        }
        self.handle_concurrent(&mut control, wiring, env, None);
        self.set_state(&mut control, DriverState::Waiting);
    }

    fn record_fault(&self, control: &mut Control, phase: &'static str, fault: &CollectorFault) {
        control.stats.collector_faults += 1;
        error!(
            target: "mesh_gc::driver",
            phase,
            faults = control.stats.collector_faults,
            "{fault}; returning to WAITING"
        );
    }
}

/// Counts a thread in `Control::waiters` until dropped, so an unwinding
/// requester does not hold off background work forever.
struct WaiterSlot<'a, 'b> {
    control: &'a mut MutexGuard<'b, Control>,
}

impl Drop for WaiterSlot<'_, '_> {
    fn drop(&mut self) {
        self.control.waiters -= 1;
    }
}

/// Run a collector callback, turning a panic into a fault.
fn guarded<T>(body: impl FnOnce() -> Result<T, CollectorFault>) -> Result<T, CollectorFault> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => Err(CollectorFault::new(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("collector panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("collector panicked: {s}")
    } else {
        "collector panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

fn worker_loop(inner: Arc<Inner>, receiver: Receiver<DriverMessage>) {
    let Some(wiring) = inner.wiring.get() else {
        let mut control = inner.control.lock();
        inner.set_state(&mut control, DriverState::Error);
        return;
    };
    let mut env = GcEnv::main_gc_thread(wiring.options.thread_name.clone());
    {
        let mut control = inner.control.lock();
        inner.set_state(&mut control, DriverState::Waiting);
    }
    info!(target: "mesh_gc::driver", thread = env.name(), "main GC thread started");

    loop {
        let message = if inner.background_work_available(wiring, &env) {
            match receiver.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => {
                    inner.run_background_phase(wiring, &env);
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match receiver.recv() {
                Ok(message) => message,
                Err(_) => break,
            }
        };

        match message {
            DriverMessage::Collect(request) => {
                env.set_cycle_state(request.cycle_state.clone());
                let mut control = inner.control.lock();
                inner.serve(&mut control, wiring, &env, &request);
            }
            DriverMessage::Terminate => {
                let mut control = inner.control.lock();
                inner.set_state(&mut control, DriverState::Terminated);
                debug!(target: "mesh_gc::driver", "main GC thread exiting");
                return;
            }
        }
    }

    error!(target: "mesh_gc::driver", "request channel disconnected");
    let mut control = inner.control.lock();
    inner.set_state(&mut control, DriverState::Error);
}

// ---------------------------------------------------------------------------
// CollectorDriver
// ---------------------------------------------------------------------------

/// Owner of the main GC thread.
///
/// Lifecycle: `new` -> `initialize` -> `startup` -> any number of
/// `garbage_collect` calls from any thread -> `shutdown`. Dropping a
/// running driver shuts it down.
pub struct CollectorDriver {
    inner: Arc<Inner>,
    spawner: Arc<dyn ThreadSpawner>,
    receiver: Mutex<Option<Receiver<DriverMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CollectorDriver {
    pub fn new() -> Self {
        Self::with_spawner(Arc::new(OsThreadSpawner))
    }

    /// Use `spawner` to create the main GC thread.
    pub fn with_spawner(spawner: Arc<dyn ThreadSpawner>) -> Self {
        CollectorDriver {
            inner: Arc::new(Inner::new()),
            spawner,
            receiver: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Wire in the collector and VM access and create the request queue.
    /// Does not start a thread.
    pub fn initialize(
        &self,
        collector: Arc<dyn Collector>,
        vm_access: Arc<dyn VmAccess>,
        options: DriverOptions,
    ) -> Result<(), DriverError> {
        let mut control = self.inner.control.lock();
        if control.state != DriverState::Disabled {
            return Err(DriverError::AlreadyInitialized(control.state));
        }
        let implicit = options.run_as_implicit;
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let wiring = Wiring {
            collector,
            vm_access,
            options,
            sender,
        };
        if self.inner.wiring.set(wiring).is_err() {
            return Err(DriverError::AlreadyInitialized(control.state));
        }
        *self.receiver.lock() = Some(receiver);
        self.inner.set_state(&mut control, DriverState::Starting);
        debug!(target: "mesh_gc::driver", implicit, "driver initialized");
        Ok(())
    }

    /// Start the main GC thread and wait until it is ready.
    pub fn startup(&self) -> Result<(), DriverError> {
        let wiring = self.inner.wiring.get().ok_or(DriverError::NotInitialized)?;
        let mut control = self.inner.control.lock();
        if control.state != DriverState::Starting {
            return Err(DriverError::AlreadyStarted(control.state));
        }

        if wiring.options.run_as_implicit {
            self.inner.set_state(&mut control, DriverState::Waiting);
            info!(target: "mesh_gc::driver", "collections run on the requesting thread");
            return Ok(());
        }

        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(DriverError::NotInitialized)?;
        let inner = Arc::clone(&self.inner);
        let body: ThreadBody = Box::new(move || worker_loop(inner, receiver));
        match self
            .spawner
            .spawn(&wiring.options.thread_name, wiring.options.stack_size, body)
        {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(err) => {
                error!(target: "mesh_gc::driver", %err, "failed to spawn main GC thread");
                self.inner.set_state(&mut control, DriverState::Error);
                return Err(DriverError::ThreadSpawn(err));
            }
        }

        while control.state == DriverState::Starting {
            self.inner.cond.wait(&mut control);
        }
        if control.state == DriverState::Error {
            return Err(DriverError::StartupFailed);
        }
        Ok(())
    }

    /// Let any in-flight cycle finish, then stop the main GC thread.
    ///
    /// Calling it on a driver that never started is an error. Calling it
    /// again after it succeeded is a no-op.
    pub fn shutdown(&self) -> Result<(), DriverError> {
        let Some(wiring) = self.inner.wiring.get() else {
            error!(target: "mesh_gc::driver", "shutdown of a driver that was never initialized");
            return Err(DriverError::NotRunning(DriverState::Disabled));
        };
        let mut control = self.inner.control.lock();
        if control.state == DriverState::Terminated {
            return Ok(());
        }
        if !control.state.is_running() || !self.inner.wait_until_idle(&mut control, wiring, false) {
            let state = control.state;
            drop(control);
            error!(target: "mesh_gc::driver", %state, "shutdown of a driver that is not running");
            self.join_worker();
            return Err(DriverError::NotRunning(state));
        }

        self.inner
            .set_state(&mut control, DriverState::TerminationRequested);
        info!(target: "mesh_gc::driver", "shutting down main GC thread");
        if wiring.options.run_as_implicit {
            self.inner.set_state(&mut control, DriverState::Terminated);
            return Ok(());
        }
        if let Err(err) = wiring.sender.try_send(DriverMessage::Terminate) {
            warn!(target: "mesh_gc::driver", %err, "main GC thread is already gone");
            self.inner.set_state(&mut control, DriverState::Terminated);
        }
        while !matches!(control.state, DriverState::Terminated | DriverState::Error) {
            self.inner.cond.wait(&mut control);
        }
        let state = control.state;
        drop(control);
        self.join_worker();
        if state == DriverState::Error {
            return Err(DriverError::NotRunning(state));
        }
        info!(target: "mesh_gc::driver", "main GC thread terminated");
        Ok(())
    }

    /// Shut down if still running and release the driver.
    pub fn tear_down(self) -> Result<(), DriverError> {
        if self.state().is_running() {
            self.shutdown()
        } else {
            Ok(())
        }
    }

    /// Request a collection and block until it has run.
    ///
    /// Returns `false` without collecting if the driver is not running
    /// (never started, failed, or shutting down).
    pub fn garbage_collect(
        &self,
        env: &GcEnv,
        allocate_description: Option<AllocateDescription>,
    ) -> bool {
        let Some(wiring) = self.inner.wiring.get() else {
            return false;
        };
        let mut control = self.inner.control.lock();
        if !self.inner.wait_until_idle(&mut control, wiring, true) {
            debug!(
                target: "mesh_gc::driver",
                state = %control.state,
                requester = env.name(),
                "collection request rejected"
            );
            return false;
        }

        let request = CollectionRequest {
            cycle_state: env.cycle_state().clone(),
            allocate_description,
            cycle_id: control.next_cycle_id,
        };
        control.next_cycle_id += 1;
        self.inner.set_state(&mut control, DriverState::GcRequested);
        debug!(
            target: "mesh_gc::driver",
            cycle = request.cycle_id,
            requester = env.name(),
            "collection requested"
        );

        if wiring.options.run_as_implicit {
            self.inner.serve(&mut control, wiring, env, &request);
            return true;
        }

        let cycle_id = request.cycle_id;
        if let Err(err) = wiring.sender.try_send(DriverMessage::Collect(request)) {
            error!(target: "mesh_gc::driver", %err, "main GC thread is not accepting requests");
            self.inner.set_state(&mut control, DriverState::Error);
            return false;
        }
        while control.completed_cycle_id < cycle_id {
            if matches!(control.state, DriverState::Error | DriverState::Terminated) {
                return false;
            }
            self.inner.cond.wait(&mut control);
        }
        true
    }

    /// Non-blocking check used by allocation paths.
    ///
    /// True in every state except `GcRequested`, including `Waiting` and
    /// `Disabled`. Use `state().is_busy()` to ask whether a cycle is
    /// actually running.
    pub fn is_garbage_collect_in_progress(&self) -> bool {
        self.inner.state() != DriverState::GcRequested
    }

    /// Current state, read without taking the control lock.
    pub fn state(&self) -> DriverState {
        self.inner.state()
    }

    pub fn stats(&self) -> DriverStats {
        self.inner.control.lock().stats
    }

    /// The options passed to `initialize`, if it has been called.
    pub fn options(&self) -> Option<&DriverOptions> {
        self.inner.wiring.get().map(|w| &w.options)
    }

    fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(target: "mesh_gc::driver", "main GC thread panicked");
            }
        }
    }
}

impl Default for CollectorDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CollectorDriver {
    fn drop(&mut self) {
        if self.state().is_running() {
            if let Err(err) = self.shutdown() {
                warn!(target: "mesh_gc::driver", %err, "shutdown on drop failed");
            }
        } else {
            self.join_worker();
        }
    }
}

impl fmt::Debug for CollectorDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorDriver")
            .field("state", &self.state())
            .field("options", &self.options())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

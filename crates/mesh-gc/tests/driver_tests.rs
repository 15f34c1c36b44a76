//! Multi-threaded tests for the main GC thread driver: request
//! serialization, shutdown draining, fault containment, and pausing of
//! background concurrent phases.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mesh_gc::{
    AllocateDescription, CollectionRequest, Collector, CollectorDriver, CollectorFault,
    ConcurrentOutcome, DriverOptions, DriverState, GcEnv, NoVmAccess, VmAccess,
};
use parking_lot::Mutex;

// ── Helpers ────────────────────────────────────────────────────────────

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn start(
    collector: Arc<dyn Collector>,
    vm_access: Arc<dyn VmAccess>,
    options: DriverOptions,
) -> CollectorDriver {
    let driver = CollectorDriver::new();
    driver.initialize(collector, vm_access, options).unwrap();
    driver.startup().unwrap();
    driver
}

/// STW-only collector that records how many cycles overlap.
#[derive(Default)]
struct ExclusiveCollector {
    running: AtomicUsize,
    max_running: AtomicUsize,
    cycles: AtomicUsize,
}

impl Collector for ExclusiveCollector {
    fn stop_the_world_collect(
        &self,
        _env: &GcEnv,
        _request: &CollectionRequest,
    ) -> Result<(), CollectorFault> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_micros(200));
        self.cycles.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn concurrent_collect(
        &self,
        _env: &GcEnv,
        _request: Option<&CollectionRequest>,
    ) -> Result<ConcurrentOutcome, CollectorFault> {
        Ok(ConcurrentOutcome::Completed)
    }

    fn is_concurrent_work_available(&self, _env: &GcEnv) -> bool {
        false
    }
}

// ── Serialization ──────────────────────────────────────────────────────

#[test]
fn concurrent_requesters_are_serialized() {
    const MUTATORS: usize = 8;
    const REQUESTS: usize = 5;

    let collector = Arc::new(ExclusiveCollector::default());
    let driver = start(collector.clone(), Arc::new(NoVmAccess), DriverOptions::default());

    crossbeam_utils::thread::scope(|scope| {
        for i in 0..MUTATORS {
            let driver = &driver;
            scope.spawn(move |_| {
                let env = GcEnv::mutator(format!("mutator-{}", i));
                for _ in 0..REQUESTS {
                    assert!(driver.garbage_collect(&env, Some(AllocateDescription::object(128))));
                }
            });
        }
    })
    .unwrap();

    assert_eq!(collector.cycles.load(Ordering::SeqCst), MUTATORS * REQUESTS);
    assert_eq!(collector.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(driver.state(), DriverState::Waiting);
    assert_eq!(driver.stats().cycles_completed, (MUTATORS * REQUESTS) as u64);

    driver.shutdown().unwrap();
    assert_eq!(driver.state(), DriverState::Terminated);
}

#[test]
fn implicit_requesters_are_serialized() {
    let collector = Arc::new(ExclusiveCollector::default());
    let options = DriverOptions {
        run_as_implicit: true,
        ..DriverOptions::default()
    };
    let driver = start(collector.clone(), Arc::new(NoVmAccess), options);

    crossbeam_utils::thread::scope(|scope| {
        for i in 0..4 {
            let driver = &driver;
            scope.spawn(move |_| {
                let env = GcEnv::mutator(format!("inline-{}", i));
                for _ in 0..10 {
                    assert!(driver.garbage_collect(&env, None));
                }
            });
        }
    })
    .unwrap();

    assert_eq!(collector.cycles.load(Ordering::SeqCst), 40);
    assert_eq!(collector.max_running.load(Ordering::SeqCst), 1);
    driver.tear_down().unwrap();
}

// ── Shutdown ───────────────────────────────────────────────────────────

/// Background concurrent phase that blocks until the test releases it.
struct GatedCollector {
    work: AtomicBool,
    entered: Sender<()>,
    gate: Receiver<()>,
    completed: AtomicUsize,
}

impl Collector for GatedCollector {
    fn stop_the_world_collect(
        &self,
        _env: &GcEnv,
        _request: &CollectionRequest,
    ) -> Result<(), CollectorFault> {
        Ok(())
    }

    fn concurrent_collect(
        &self,
        _env: &GcEnv,
        _request: Option<&CollectionRequest>,
    ) -> Result<ConcurrentOutcome, CollectorFault> {
        self.entered.send(()).unwrap();
        self.gate.recv().unwrap();
        self.work.store(false, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ConcurrentOutcome::Completed)
    }

    fn is_concurrent_work_available(&self, _env: &GcEnv) -> bool {
        self.work.load(Ordering::SeqCst)
    }
}

#[test]
fn shutdown_waits_for_running_concurrent_phase() {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let collector = Arc::new(GatedCollector {
        work: AtomicBool::new(true),
        entered: entered_tx,
        gate: gate_rx,
        completed: AtomicUsize::new(0),
    });
    let driver = start(collector.clone(), Arc::new(NoVmAccess), DriverOptions::default());

    // The worker picks up the background work on its own.
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(driver.state(), DriverState::RunningConcurrent);

    crossbeam_utils::thread::scope(|scope| {
        let stopper = scope.spawn(|_| driver.shutdown());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.state(), DriverState::RunningConcurrent);
        assert_eq!(collector.completed.load(Ordering::SeqCst), 0);

        gate_tx.send(()).unwrap();
        stopper.join().unwrap().unwrap();
    })
    .unwrap();

    assert_eq!(collector.completed.load(Ordering::SeqCst), 1);
    assert_eq!(driver.state(), DriverState::Terminated);
    assert_eq!(driver.stats().concurrent_phases, 1);
}

#[test]
fn requests_after_shutdown_are_rejected() {
    let collector = Arc::new(ExclusiveCollector::default());
    let driver = start(collector.clone(), Arc::new(NoVmAccess), DriverOptions::default());
    driver.shutdown().unwrap();

    let env = GcEnv::mutator("late");
    assert!(!driver.garbage_collect(&env, None));
    assert_eq!(collector.cycles.load(Ordering::SeqCst), 0);
}

// ── Fault containment ──────────────────────────────────────────────────

/// Panics on the first cycle, reports a fault on the second, then works.
#[derive(Default)]
struct FlakyCollector {
    calls: AtomicUsize,
}

impl Collector for FlakyCollector {
    fn stop_the_world_collect(
        &self,
        _env: &GcEnv,
        _request: &CollectionRequest,
    ) -> Result<(), CollectorFault> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => panic!("sweep hit a corrupt header"),
            1 => Err(CollectorFault::new("mark stack overflow")),
            _ => Ok(()),
        }
    }

    fn concurrent_collect(
        &self,
        _env: &GcEnv,
        _request: Option<&CollectionRequest>,
    ) -> Result<ConcurrentOutcome, CollectorFault> {
        Ok(ConcurrentOutcome::Completed)
    }

    fn is_concurrent_work_available(&self, _env: &GcEnv) -> bool {
        false
    }
}

#[derive(Default)]
struct CountingVmAccess {
    exclusive: AtomicUsize,
    released: AtomicUsize,
}

impl VmAccess for CountingVmAccess {
    fn acquire_exclusive(&self, _env: &GcEnv) {
        self.exclusive.fetch_add(1, Ordering::SeqCst);
    }
    fn release_exclusive(&self, _env: &GcEnv) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
    fn acquire_shared(&self, _env: &GcEnv) {}
    fn release_shared(&self, _env: &GcEnv) {}
}

#[test]
fn collector_faults_do_not_wedge_the_driver() {
    let collector = Arc::new(FlakyCollector::default());
    let vm = Arc::new(CountingVmAccess::default());
    let driver = start(collector.clone(), vm.clone(), DriverOptions::default());
    let env = GcEnv::mutator("m");

    assert!(driver.garbage_collect(&env, None));
    assert_eq!(driver.state(), DriverState::Waiting);
    assert!(driver.garbage_collect(&env, None));
    assert!(driver.garbage_collect(&env, None));

    let stats = driver.stats();
    assert_eq!(stats.collector_faults, 2);
    assert_eq!(stats.cycles_completed, 3);
    assert_eq!(collector.calls.load(Ordering::SeqCst), 3);
    // Exclusive access is released even when the body panics.
    assert_eq!(vm.exclusive.load(Ordering::SeqCst), 3);
    assert_eq!(vm.released.load(Ordering::SeqCst), 3);

    driver.shutdown().unwrap();
}

// ── Concurrent phases ──────────────────────────────────────────────────

/// A background phase that runs until paused or told to finish. A resumed
/// phase completes right away.
#[derive(Default)]
struct PausableCollector {
    work: AtomicBool,
    started: AtomicBool,
    pause: AtomicBool,
    finish: AtomicBool,
    phases: AtomicUsize,
    pause_requests: AtomicUsize,
    stw: AtomicUsize,
    requested_phases: Mutex<Vec<Option<u64>>>,
}

impl Collector for PausableCollector {
    fn stop_the_world_collect(
        &self,
        _env: &GcEnv,
        _request: &CollectionRequest,
    ) -> Result<(), CollectorFault> {
        self.stw.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn concurrent_collect(
        &self,
        _env: &GcEnv,
        request: Option<&CollectionRequest>,
    ) -> Result<ConcurrentOutcome, CollectorFault> {
        self.requested_phases.lock().push(request.map(|r| r.cycle_id));
        if self.phases.fetch_add(1, Ordering::SeqCst) > 0 {
            self.work.store(false, Ordering::SeqCst);
            return Ok(ConcurrentOutcome::Completed);
        }
        self.started.store(true, Ordering::SeqCst);
        loop {
            if self.pause.swap(false, Ordering::SeqCst) {
                return Ok(ConcurrentOutcome::Suspended);
            }
            if self.finish.load(Ordering::SeqCst) {
                self.work.store(false, Ordering::SeqCst);
                return Ok(ConcurrentOutcome::Completed);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn is_concurrent_work_available(&self, _env: &GcEnv) -> bool {
        self.work.load(Ordering::SeqCst)
    }

    fn request_concurrent_pause(&self) {
        self.pause_requests.fetch_add(1, Ordering::SeqCst);
        self.pause.store(true, Ordering::SeqCst);
    }
}

#[test]
fn requester_pauses_resumable_background_phase() {
    let collector = Arc::new(PausableCollector {
        work: AtomicBool::new(true),
        ..PausableCollector::default()
    });
    let options = DriverOptions {
        concurrent_resumable: true,
        ..DriverOptions::default()
    };
    let driver = start(collector.clone(), Arc::new(NoVmAccess), options);
    wait_for("background phase", || collector.started.load(Ordering::SeqCst));

    let env = GcEnv::mutator("m");
    assert!(driver.garbage_collect(&env, None));

    let stats = driver.stats();
    assert_eq!(collector.pause_requests.load(Ordering::SeqCst), 1);
    assert_eq!(stats.concurrent_suspensions, 1);
    assert_eq!(stats.concurrent_phases, 2);
    assert_eq!(stats.cycles_completed, 1);
    // The suspended background phase was resumed on behalf of the request.
    assert_eq!(*collector.requested_phases.lock(), vec![None, Some(1)]);
    assert_eq!(collector.stw.load(Ordering::SeqCst), 0);

    driver.shutdown().unwrap();
}

#[test]
fn requester_waits_for_non_resumable_background_phase() {
    let collector = Arc::new(PausableCollector {
        work: AtomicBool::new(true),
        ..PausableCollector::default()
    });
    let driver = start(collector.clone(), Arc::new(NoVmAccess), DriverOptions::default());
    wait_for("background phase", || collector.started.load(Ordering::SeqCst));

    crossbeam_utils::thread::scope(|scope| {
        let requester = scope.spawn(|_| driver.garbage_collect(&GcEnv::mutator("m"), None));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.state(), DriverState::RunningConcurrent);
        collector.finish.store(true, Ordering::SeqCst);
        assert!(requester.join().unwrap());
    })
    .unwrap();

    let stats = driver.stats();
    assert_eq!(collector.pause_requests.load(Ordering::SeqCst), 0);
    assert_eq!(stats.concurrent_suspensions, 0);
    // The background phase finished the work, so the request ran STW.
    assert_eq!(collector.stw.load(Ordering::SeqCst), 1);
    assert_eq!(stats.cycles_completed, 1);

    driver.shutdown().unwrap();
}

/// Its pause hook panics. The background phase runs until told to finish;
/// later phases complete right away.
#[derive(Default)]
struct BrokenPauseCollector {
    work: AtomicBool,
    started: AtomicBool,
    finish: AtomicBool,
    phases: AtomicUsize,
    stw: AtomicUsize,
}

impl Collector for BrokenPauseCollector {
    fn stop_the_world_collect(
        &self,
        _env: &GcEnv,
        _request: &CollectionRequest,
    ) -> Result<(), CollectorFault> {
        self.stw.fetch_add(1, Ordering::SeqCst);
        // Leave work for a background phase after this cycle.
        self.work.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn concurrent_collect(
        &self,
        _env: &GcEnv,
        _request: Option<&CollectionRequest>,
    ) -> Result<ConcurrentOutcome, CollectorFault> {
        if self.phases.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.store(true, Ordering::SeqCst);
            while !self.finish.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.work.store(false, Ordering::SeqCst);
        Ok(ConcurrentOutcome::Completed)
    }

    fn is_concurrent_work_available(&self, _env: &GcEnv) -> bool {
        self.work.load(Ordering::SeqCst)
    }

    fn request_concurrent_pause(&self) {
        panic!("pause hook is broken");
    }
}

#[test]
fn panicking_pause_hook_is_contained() {
    let collector = Arc::new(BrokenPauseCollector {
        work: AtomicBool::new(true),
        ..BrokenPauseCollector::default()
    });
    let options = DriverOptions {
        concurrent_resumable: true,
        ..DriverOptions::default()
    };
    let driver = start(collector.clone(), Arc::new(NoVmAccess), options);
    wait_for("background phase", || collector.started.load(Ordering::SeqCst));

    crossbeam_utils::thread::scope(|scope| {
        let requester = scope.spawn(|_| driver.garbage_collect(&GcEnv::mutator("m"), None));
        wait_for("pause fault", || driver.stats().collector_faults == 1);
        // The phase was never told to pause, so the requester still waits.
        assert_eq!(driver.state(), DriverState::RunningConcurrent);
        collector.finish.store(true, Ordering::SeqCst);
        assert!(requester.join().unwrap());
    })
    .unwrap();

    assert_eq!(collector.stw.load(Ordering::SeqCst), 1);
    // The requester no longer counts as waiting: the work left by its cycle
    // runs in the background.
    wait_for("second background phase", || collector.phases.load(Ordering::SeqCst) == 2);
    assert_eq!(driver.stats().collector_faults, 1);

    driver.shutdown().unwrap();
    assert_eq!(driver.stats().concurrent_phases, 2);
}

#[derive(Default)]
struct SharedAccessRecorder {
    shared_held: AtomicBool,
    observed_shared: AtomicBool,
}

impl VmAccess for SharedAccessRecorder {
    fn acquire_exclusive(&self, _env: &GcEnv) {}
    fn release_exclusive(&self, _env: &GcEnv) {}
    fn acquire_shared(&self, _env: &GcEnv) {
        self.shared_held.store(true, Ordering::SeqCst);
    }
    fn release_shared(&self, _env: &GcEnv) {
        self.shared_held.store(false, Ordering::SeqCst);
    }
}

struct AccessCheckingCollector {
    vm: Arc<SharedAccessRecorder>,
    work: AtomicBool,
}

impl Collector for AccessCheckingCollector {
    fn stop_the_world_collect(
        &self,
        _env: &GcEnv,
        _request: &CollectionRequest,
    ) -> Result<(), CollectorFault> {
        Ok(())
    }

    fn concurrent_collect(
        &self,
        _env: &GcEnv,
        _request: Option<&CollectionRequest>,
    ) -> Result<ConcurrentOutcome, CollectorFault> {
        if self.vm.shared_held.load(Ordering::SeqCst) {
            self.vm.observed_shared.store(true, Ordering::SeqCst);
        }
        self.work.store(false, Ordering::SeqCst);
        Ok(ConcurrentOutcome::Completed)
    }

    fn is_concurrent_work_available(&self, _env: &GcEnv) -> bool {
        self.work.load(Ordering::SeqCst)
    }
}

#[test]
fn concurrent_phase_holds_shared_access_when_configured() {
    let vm = Arc::new(SharedAccessRecorder::default());
    let collector = Arc::new(AccessCheckingCollector {
        vm: vm.clone(),
        work: AtomicBool::new(false),
    });
    let options = DriverOptions {
        acquire_vm_access_during_concurrent: true,
        ..DriverOptions::default()
    };
    let driver = start(collector.clone(), vm.clone(), options);

    collector.work.store(true, Ordering::SeqCst);
    assert!(driver.garbage_collect(&GcEnv::mutator("m"), None));
    wait_for("concurrent phase", || !collector.work.load(Ordering::SeqCst));

    assert!(vm.observed_shared.load(Ordering::SeqCst));
    assert!(!vm.shared_held.load(Ordering::SeqCst));
    driver.shutdown().unwrap();
}

//! Lifecycle states of the main GC thread.

use std::fmt;

/// Where the driver is in its lifecycle.
///
/// ```text
/// Disabled --initialize--> Starting --thread ready--> Waiting
///                          Starting --spawn failed--> Error
/// Waiting --garbage_collect--> GcRequested --STW done--> Waiting
///                              GcRequested --concurrent--> RunningConcurrent --> Waiting
/// Waiting --shutdown--> TerminationRequested --worker exits--> Terminated
/// ```
///
/// `Error` is distinct from `Disabled`: it means startup or the worker
/// failed, not that nothing was configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DriverState {
    Error = 0,
    Disabled = 1,
    Starting = 2,
    Waiting = 3,
    GcRequested = 4,
    RunningConcurrent = 5,
    TerminationRequested = 6,
    Terminated = 7,
}

impl DriverState {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> DriverState {
        match raw {
            1 => DriverState::Disabled,
            2 => DriverState::Starting,
            3 => DriverState::Waiting,
            4 => DriverState::GcRequested,
            5 => DriverState::RunningConcurrent,
            6 => DriverState::TerminationRequested,
            7 => DriverState::Terminated,
            _ => DriverState::Error,
        }
    }

    /// A cycle is in flight; new requesters must wait for `Waiting`.
    pub fn is_busy(self) -> bool {
        matches!(self, DriverState::GcRequested | DriverState::RunningConcurrent)
    }

    /// The driver can still serve requests, now or after the current cycle.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            DriverState::Waiting | DriverState::GcRequested | DriverState::RunningConcurrent
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            DriverState::Error => "ERROR",
            DriverState::Disabled => "DISABLED",
            DriverState::Starting => "STARTING",
            DriverState::Waiting => "WAITING",
            DriverState::GcRequested => "GC_REQUESTED",
            DriverState::RunningConcurrent => "RUNNING_CONCURRENT",
            DriverState::TerminationRequested => "TERMINATION_REQUESTED",
            DriverState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

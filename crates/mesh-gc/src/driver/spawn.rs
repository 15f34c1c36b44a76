//! Creation of the main GC thread.
//!
//! Spawning goes through a trait so a host with its own thread primitive
//! (or a test that wants spawning to fail) can supply one.

use std::io;
use std::thread::{self, JoinHandle};

/// The body the spawned thread runs.
pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

pub trait ThreadSpawner: Send + Sync {
    /// Start `body` on a new thread. An `Err` leaves the driver in `Error`.
    fn spawn(
        &self,
        name: &str,
        stack_size: Option<usize>,
        body: ThreadBody,
    ) -> io::Result<JoinHandle<()>>;
}

/// Spawns a named OS thread with `std::thread::Builder`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsThreadSpawner;

impl ThreadSpawner for OsThreadSpawner {
    fn spawn(
        &self,
        name: &str,
        stack_size: Option<usize>,
        body: ThreadBody,
    ) -> io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(name.to_string());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(body)
    }
}

//! The process-spawning seam.
//!
//! Spawning processes and allocating terminals belong to the runtime's
//! collaborators. A `ProcessDriver` receives the container's stdio endpoints,
//! runs the process however it likes, and reports a single exit code.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::container::ContainerConfig;
use crate::error::LifecycleError;
use crate::signal::{self, StopSignal};
use crate::stdio::OutputEndpoint;

/// Exit code recorded when a driver drops its exit channel without reporting.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Exit code recorded when the process could not be spawned at all.
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// The container-side stdio handed to a driver at start.
///
/// In tty mode drivers publish everything on `stdout`; `stderr` stays silent.
pub struct ProcessStdio {
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub stdout: OutputEndpoint,
    pub stderr: OutputEndpoint,
}

/// Delivers signals to a spawned process.
pub trait Signaller: Send + Sync {
    fn signal(&self, signal: StopSignal) -> Result<(), LifecycleError>;
}

/// Signals a process by pid.
///
/// Clones share one pid. Once the waiter has reaped the process it calls
/// `disarm`, after which the pid may belong to someone else and signalling
/// fails instead.
#[derive(Clone, Debug)]
pub struct PidSignaller {
    pid: Arc<Mutex<Option<u32>>>,
}

impl PidSignaller {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid: Arc::new(Mutex::new(pid)),
        }
    }

    pub fn disarm(&self) {
        self.pid.lock().take();
    }
}

impl Signaller for PidSignaller {
    fn signal(&self, signal: StopSignal) -> Result<(), LifecycleError> {
        // Held across delivery so a concurrent disarm waits for us.
        let guard = self.pid.lock();
        let pid = guard.ok_or_else(|| {
            LifecycleError::SignalDeliveryFailed("no live process to signal".to_string())
        })?;
        signal::deliver(pid, signal)
    }
}

/// A running process as seen by the lifecycle monitor.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    /// Resolves once the process has exited and its output has been published.
    pub exit: oneshot::Receiver<i32>,
    pub signaller: Box<dyn Signaller>,
}

/// Spawns container processes.
pub trait ProcessDriver: Send + Sync {
    /// Start the process described by `config`, wiring it to `stdio`.
    ///
    /// Must be called from within a tokio runtime.
    fn spawn(
        &self,
        config: &ContainerConfig,
        stdio: ProcessStdio,
    ) -> Result<SpawnedProcess, LifecycleError>;
}

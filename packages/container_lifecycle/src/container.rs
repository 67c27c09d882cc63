use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::driver::{Signaller, UNKNOWN_EXIT_CODE};
use crate::error::LifecycleError;
use crate::ids::ContainerId;
use crate::signal::StopSignal;
use crate::stdio::{OutputEndpoint, StdinEndpoint};

/// Process the container runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Creation-time settings. Fixed for the container's lifetime.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub process: ProcessSpec,
    /// Merge stdout/stderr into one terminal stream.
    #[serde(default)]
    pub tty: bool,
    /// Close container stdin once the first attached client's input ends.
    #[serde(default)]
    pub stdin_once: bool,
    /// Remove the container as soon as it stops.
    #[serde(default)]
    pub auto_remove: bool,
}

impl ContainerConfig {
    pub fn new(process: ProcessSpec) -> Self {
        Self {
            process,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped { exit_code: i32 },
    Removed,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Stopped or already removed.
    pub fn has_exited(&self) -> bool {
        matches!(self, Self::Stopped { .. } | Self::Removed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped { .. } => "stopped",
            Self::Removed => "removed",
        }
    }
}

/// Serializable snapshot for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: Option<String>,
    pub command: String,
    pub state: ContainerState,
    pub tty: bool,
    pub auto_remove: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub created_at: String,
}

/// A container's run state and stdio endpoints.
///
/// State transitions are performed only by `LifecycleMonitor`; everything else
/// reads snapshots or waits on the state signal.
pub struct Container {
    id: ContainerId,
    config: ContainerConfig,
    created_at: DateTime<Utc>,
    state: watch::Sender<ContainerState>,
    exit_code: OnceLock<i32>,
    pid: Mutex<Option<u32>>,
    signaller: Mutex<Option<Box<dyn Signaller>>>,
    stdin: StdinEndpoint,
    stdin_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stdout: OutputEndpoint,
    stderr: OutputEndpoint,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        config: ContainerConfig,
        stdin_capacity: usize,
        output_capacity: usize,
    ) -> Self {
        let (stdin, stdin_rx) = StdinEndpoint::channel(stdin_capacity);
        let (state, _) = watch::channel(ContainerState::Created);
        Self {
            id,
            config,
            created_at: Utc::now(),
            state,
            exit_code: OnceLock::new(),
            pid: Mutex::new(None),
            signaller: Mutex::new(None),
            stdin,
            stdin_rx: Mutex::new(Some(stdin_rx)),
            stdout: OutputEndpoint::new("stdout", output_capacity),
            stderr: OutputEndpoint::new("stderr", output_capacity),
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ContainerState {
        *self.state.borrow()
    }

    /// Lock-protected snapshot; never waits on I/O.
    pub fn is_running(&self) -> bool {
        self.state.borrow().is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// Recorded once the container has stopped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn stdin(&self) -> &StdinEndpoint {
        &self.stdin
    }

    pub fn stdout(&self) -> &OutputEndpoint {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputEndpoint {
        &self.stderr
    }

    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: self.config.name.clone(),
            command: self.config.process.command.clone(),
            state: self.state(),
            tty: self.config.tty,
            auto_remove: self.config.auto_remove,
            pid: self.pid(),
            exit_code: self.exit_code(),
            created_at: self.created_at.to_rfc3339(),
        }
    }

    /// Request termination. Reports signal delivery only; the state changes
    /// later, when the watcher observes the exit.
    pub fn kill(&self, signal: StopSignal) -> Result<(), LifecycleError> {
        if !self.is_running() {
            return Err(LifecycleError::NotRunning(self.id.to_string()));
        }
        let signaller = self.signaller.lock();
        let signaller = signaller
            .as_ref()
            .ok_or_else(|| LifecycleError::NotRunning(self.id.to_string()))?;
        info!("Sending {} to container {}", signal, self.id.short());
        signaller.signal(signal)
    }

    /// Readiness signal: resolves once `start` has left the `Created` state.
    pub async fn wait_running(&self) -> Result<(), LifecycleError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ContainerState::Created)
            .await
            .map_err(|_| LifecycleError::NotFound(self.id.to_string()))?;
        if state.is_running() {
            Ok(())
        } else {
            Err(LifecycleError::NotRunning(self.id.to_string()))
        }
    }

    /// Wait for the container to stop and return its exit code.
    ///
    /// `None` waits without bound, `Some(Duration::ZERO)` polls once, any other
    /// value waits at most that long and yields `Timeout` on expiry. With
    /// auto-remove enabled a waiter is only released once the container has
    /// also been removed.
    pub async fn wait_stop(&self, timeout: Option<Duration>) -> Result<i32, LifecycleError> {
        let auto_remove = self.config.auto_remove;
        let done = move |s: &ContainerState| match s {
            ContainerState::Removed => true,
            ContainerState::Stopped { .. } => !auto_remove,
            _ => false,
        };

        let mut rx = self.state.subscribe();
        match timeout {
            Some(limit) if limit.is_zero() => {
                if !done(&*rx.borrow()) {
                    return Err(LifecycleError::Timeout(limit));
                }
            }
            Some(limit) => {
                tokio::time::timeout(limit, rx.wait_for(done))
                    .await
                    .map_err(|_| LifecycleError::Timeout(limit))?
                    .map(|_| ())
                    .map_err(|_| LifecycleError::NotFound(self.id.to_string()))?;
            }
            None => {
                rx.wait_for(done)
                    .await
                    .map(|_| ())
                    .map_err(|_| LifecycleError::NotFound(self.id.to_string()))?;
            }
        }
        Ok(self.exit_code().unwrap_or(UNKNOWN_EXIT_CODE))
    }

    /// Resolves once the container has stopped, regardless of auto-remove.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.has_exited()).await;
    }

    /// Close container stdin so the process sees end-of-file.
    pub fn close_stdin(&self) -> bool {
        let closed = self.stdin.close();
        if closed {
            debug!("Closed stdin of container {}", self.id.short());
        }
        closed
    }

    // --- transitions, driven by LifecycleMonitor ---

    /// Claims the stdin receiver; only the first caller gets it.
    pub(crate) fn take_stdin_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        if self.state() != ContainerState::Created {
            return None;
        }
        self.stdin_rx.lock().take()
    }

    pub(crate) fn mark_running(&self, pid: Option<u32>, signaller: Box<dyn Signaller>) {
        *self.pid.lock() = pid;
        *self.signaller.lock() = Some(signaller);
        self.state.send_replace(ContainerState::Running);
    }

    /// Record the exit, close every endpoint and move to `Stopped`.
    ///
    /// Returns false if the container had already stopped. Waiters are not
    /// released here when auto-remove is set; `mark_removed` does that.
    pub(crate) fn mark_stopped(&self, exit_code: i32) -> bool {
        if self.exit_code.set(exit_code).is_err() {
            return false;
        }
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();
        self.signaller.lock().take();

        let auto_remove = self.config.auto_remove;
        self.state.send_if_modified(|state| {
            *state = ContainerState::Stopped { exit_code };
            !auto_remove
        });
        true
    }

    /// `Created → Removed` for a container that never ran. Fails once the
    /// process has been handed its stdin.
    pub(crate) fn mark_discarded(&self) -> bool {
        if self.take_stdin_receiver().is_none() {
            return false;
        }
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();
        self.state.send_replace(ContainerState::Removed);
        true
    }

    /// `Stopped → Removed`, at most once.
    pub(crate) fn mark_removed(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            ContainerState::Stopped { .. } => {
                *state = ContainerState::Removed;
                true
            }
            _ => false,
        })
    }
}

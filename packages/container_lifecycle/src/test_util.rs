//! In-memory process drivers for tests.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::container::ContainerConfig;
use crate::driver::{ProcessDriver, ProcessStdio, Signaller, SpawnedProcess};
use crate::error::LifecycleError;
use crate::signal::StopSignal;

struct ChannelSignaller(mpsc::UnboundedSender<StopSignal>);

impl Signaller for ChannelSignaller {
    fn signal(&self, signal: StopSignal) -> Result<(), LifecycleError> {
        self.0
            .send(signal)
            .map_err(|_| LifecycleError::SignalDeliveryFailed("process is gone".to_string()))
    }
}

/// Echoes every stdin chunk to stdout until signalled, like `cat` in raw mode.
#[derive(Clone, Debug, Default)]
pub struct EchoDriver {
    exit_on_eof: bool,
}

impl EchoDriver {
    /// Exit with code 0 when stdin is closed instead of waiting for a signal.
    pub fn exiting_on_eof() -> Self {
        Self { exit_on_eof: true }
    }
}

impl ProcessDriver for EchoDriver {
    fn spawn(
        &self,
        _config: &ContainerConfig,
        stdio: ProcessStdio,
    ) -> Result<SpawnedProcess, LifecycleError> {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<StopSignal>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let ProcessStdio {
            mut stdin, stdout, ..
        } = stdio;
        let exit_on_eof = self.exit_on_eof;

        tokio::spawn(async move {
            let mut stdin_open = true;
            let code = loop {
                tokio::select! {
                    chunk = stdin.recv(), if stdin_open => match chunk {
                        // A stalled reader holds up the echo, but never a signal.
                        Some(chunk) => tokio::select! {
                            _ = stdout.publish(chunk) => {}
                            Some(signal) = signal_rx.recv() => break signal.exit_code(),
                        },
                        None if exit_on_eof => break 0,
                        None => stdin_open = false,
                    },
                    Some(signal) = signal_rx.recv() => break signal.exit_code(),
                    else => break 0,
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid: None,
            exit: exit_rx,
            signaller: Box::new(ChannelSignaller(signal_tx)),
        })
    }
}

/// Writes fixed output, then exits with a fixed code.
#[derive(Clone, Debug, Default)]
pub struct ExitDriver {
    code: i32,
    delay: Duration,
    output: Vec<u8>,
}

impl ExitDriver {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_output(mut self, output: &[u8]) -> Self {
        self.output = output.to_vec();
        self
    }
}

impl ProcessDriver for ExitDriver {
    fn spawn(
        &self,
        _config: &ContainerConfig,
        stdio: ProcessStdio,
    ) -> Result<SpawnedProcess, LifecycleError> {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<StopSignal>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let driver = self.clone();

        tokio::spawn(async move {
            let code = tokio::select! {
                code = async move {
                    if !driver.output.is_empty() {
                        stdio.stdout.publish(driver.output).await;
                    }
                    tokio::time::sleep(driver.delay).await;
                    driver.code
                } => code,
                Some(signal) = signal_rx.recv() => signal.exit_code(),
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid: None,
            exit: exit_rx,
            signaller: Box::new(ChannelSignaller(signal_tx)),
        })
    }
}

/// Never manages to spawn anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingDriver;

impl ProcessDriver for FailingDriver {
    fn spawn(
        &self,
        config: &ContainerConfig,
        _stdio: ProcessStdio,
    ) -> Result<SpawnedProcess, LifecycleError> {
        Err(LifecycleError::SpawnFailed(format!(
            "{}: no such file or directory",
            config.process.command
        )))
    }
}

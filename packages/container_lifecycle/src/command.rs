use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::container::ContainerConfig;
use crate::driver::{PidSignaller, ProcessDriver, ProcessStdio, SpawnedProcess, UNKNOWN_EXIT_CODE};
use crate::error::LifecycleError;
use crate::stdio::OutputEndpoint;

/// Default time to wait for trailing output after the process exits.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default size of each read from the process's pipes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Runs container processes as plain child processes with piped stdio.
///
/// A tty container run through this driver has its stderr merged into stdout.
#[derive(Clone, Debug)]
pub struct CommandDriver {
    drain_timeout: Duration,
    read_buffer_size: usize,
}

impl Default for CommandDriver {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl CommandDriver {
    pub fn new(drain_timeout: Duration, read_buffer_size: usize) -> Self {
        Self {
            drain_timeout,
            read_buffer_size: read_buffer_size.max(1),
        }
    }
}

impl ProcessDriver for CommandDriver {
    fn spawn(
        &self,
        config: &ContainerConfig,
        stdio: ProcessStdio,
    ) -> Result<SpawnedProcess, LifecycleError> {
        let process = &config.process;
        let mut cmd = Command::new(&process.command);
        cmd.args(&process.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &process.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &process.env {
            cmd.env(key, value);
        }

        info!("Spawning command: {} with args: {:?}", process.command, process.args);
        let mut child = cmd
            .spawn()
            .map_err(|e| LifecycleError::SpawnFailed(format!("{}: {}", process.command, e)))?;
        let pid = child.id();

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(pump_stdin(stdin, stdio.stdin));
        }

        let stderr_target = if config.tty {
            stdio.stdout.clone()
        } else {
            stdio.stderr
        };
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(
                stdout,
                stdio.stdout,
                self.read_buffer_size,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(
                stderr,
                stderr_target,
                self.read_buffer_size,
            )));
        }

        let signaller = PidSignaller::new(pid);
        let reaped = signaller.clone();
        let (exit_tx, exit_rx) = oneshot::channel();
        let drain_timeout = self.drain_timeout;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("Failed to wait for process {:?}: {}", pid, e);
                    UNKNOWN_EXIT_CODE
                }
            };
            reaped.disarm();
            // A grandchild holding the pipes open must not keep the container alive.
            for pump in pumps {
                if tokio::time::timeout(drain_timeout, pump).await.is_err() {
                    warn!("Output of process {:?} still open after exit", pid);
                }
            }
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid,
            exit: exit_rx,
            signaller: Box::new(signaller),
        })
    }
}

async fn pump_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!("Process stdin closed: {}", e);
            return;
        }
        if stdin.flush().await.is_err() {
            return;
        }
    }
    // Endpoint closed: dropping the pipe delivers EOF to the process.
}

async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, endpoint: OutputEndpoint, size: usize) {
    let mut buffer = vec![0u8; size];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if !endpoint.publish(buffer[..n].to_vec()).await {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading process {}: {}", endpoint.name(), e);
                break;
            }
        }
    }
    debug!("Process {} pump exiting", endpoint.name());
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::command::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_READ_BUFFER_SIZE};
use crate::container::ContainerConfig;
use crate::driver::{PidSignaller, ProcessDriver, ProcessStdio, SpawnedProcess, UNKNOWN_EXIT_CODE};
use crate::error::LifecycleError;
use crate::stdio::OutputEndpoint;

/// Runs container processes on a pseudo-terminal.
///
/// Stdout and stderr share the terminal, so everything the process writes is
/// published on the stdout endpoint. Blocking PTY I/O runs on dedicated
/// threads.
#[derive(Clone, Debug)]
pub struct PtyDriver {
    rows: u16,
    cols: u16,
    raw: bool,
    drain_timeout: Duration,
    read_buffer_size: usize,
}

impl Default for PtyDriver {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            raw: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl PtyDriver {
    pub fn new(drain_timeout: Duration, read_buffer_size: usize) -> Self {
        Self {
            drain_timeout,
            read_buffer_size: read_buffer_size.max(1),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    /// Put the terminal line discipline into raw mode: no echo, no line
    /// buffering, no signal characters.
    pub fn with_raw_mode(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    fn open(
        &self,
        config: &ContainerConfig,
    ) -> Result<(Box<dyn MasterPty + Send>, Box<dyn Child + Send + Sync>)> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        #[cfg(unix)]
        if self.raw {
            make_raw(pair.master.as_ref()).context("Failed to set PTY raw mode")?;
        }

        let process = &config.process;
        let mut cmd = CommandBuilder::new(&process.command);
        for arg in &process.args {
            cmd.arg(arg);
        }
        if let Some(dir) = &process.working_dir {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &process.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            process.command, process.args
        );
        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", process.command))?;
        // The slave end must only be held by the child, or reads never see EOF.
        drop(pair.slave);

        Ok((pair.master, child))
    }
}

impl ProcessDriver for PtyDriver {
    fn spawn(
        &self,
        config: &ContainerConfig,
        stdio: ProcessStdio,
    ) -> Result<SpawnedProcess, LifecycleError> {
        let (master, child) = self.open(config).map_err(|e| {
            error!("{:#}", e);
            LifecycleError::SpawnFailed(format!("{:#}", e))
        })?;
        let pid = child.process_id();

        let reader = master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(|e| LifecycleError::SpawnFailed(format!("{:#}", e)))?;
        let writer = master
            .take_writer()
            .context("Failed to take PTY writer")
            .map_err(|e| LifecycleError::SpawnFailed(format!("{:#}", e)))?;

        let (drained_tx, drained_rx) = std::sync::mpsc::channel();
        let read_buffer_size = self.read_buffer_size;
        let stdout = stdio.stdout;
        std::thread::spawn(move || {
            read_loop(reader, &stdout, read_buffer_size);
            let _ = drained_tx.send(());
        });

        let mut stdin = stdio.stdin;
        std::thread::spawn(move || {
            let mut writer = writer;
            while let Some(chunk) = stdin.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    debug!("PTY stdin closed: {}", e);
                    break;
                }
            }
            // Dropping the writer sends end-of-file to the terminal.
            debug!("PTY writer thread exiting");
        });

        let signaller = PidSignaller::new(pid);
        let reaped = signaller.clone();
        let (exit_tx, exit_rx) = oneshot::channel();
        let drain_timeout = self.drain_timeout;
        std::thread::spawn(move || {
            let code = wait_child(child, pid);
            reaped.disarm();
            if drained_rx.recv_timeout(drain_timeout).is_err() {
                warn!("Output of PTY process {:?} still open after exit", pid);
            }
            drop(master);
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess {
            pid,
            exit: exit_rx,
            signaller: Box::new(signaller),
        })
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, stdout: &OutputEndpoint, size: usize) {
    let mut buffer = vec![0u8; size];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                info!("PTY EOF detected - process has exited");
                break;
            }
            Ok(n) => {
                if !stdout.blocking_publish(buffer[..n].to_vec()) {
                    break;
                }
            }
            // Linux reports EIO once the last slave descriptor is closed.
            Err(e) => {
                debug!("PTY read ended: {}", e);
                break;
            }
        }
    }
    info!("PTY reader thread exiting");
}

#[cfg(unix)]
fn wait_child(child: Box<dyn Child + Send + Sync>, pid: Option<u32>) -> i32 {
    use nix::errno::Errno;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return wait_portable(child);
    };
    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => return 128 + signal as i32,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Failed to wait for PTY process {}: {}", pid, e);
                return UNKNOWN_EXIT_CODE;
            }
        }
    }
}

#[cfg(not(unix))]
fn wait_child(child: Box<dyn Child + Send + Sync>, _pid: Option<u32>) -> i32 {
    wait_portable(child)
}

fn wait_portable(mut child: Box<dyn Child + Send + Sync>) -> i32 {
    match child.wait() {
        Ok(status) => status.exit_code() as i32,
        Err(e) => {
            warn!("Failed to wait for PTY process: {}", e);
            UNKNOWN_EXIT_CODE
        }
    }
}

#[cfg(unix)]
fn make_raw(master: &dyn MasterPty) -> Result<()> {
    use nix::sys::termios::{self, SetArg};
    use std::os::fd::BorrowedFd;

    let fd = master
        .as_raw_fd()
        .context("PTY master has no file descriptor")?;
    // SAFETY: the descriptor is owned by `master`, which outlives this call.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut attrs = termios::tcgetattr(fd)?;
    termios::cfmakeraw(&mut attrs);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

//! Local terminal plumbing for the `berth` binary.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long the stdin thread blocks before rechecking for shutdown.
#[cfg(unix)]
const STDIN_POLL_MS: u16 = 100;

/// Puts the local terminal into raw mode and restores it on drop, so the
/// detach keys reach the session instead of the line discipline.
///
/// Inert when stdin is not a terminal.
#[cfg(unix)]
pub struct TerminalGuard {
    saved: Option<nix::sys::termios::Termios>,
    raw: bool,
}

#[cfg(unix)]
impl TerminalGuard {
    pub fn new() -> Self {
        let saved = nix::sys::termios::tcgetattr(std::io::stdin()).ok();
        Self { saved, raw: false }
    }

    pub fn is_terminal(&self) -> bool {
        self.saved.is_some()
    }

    pub fn enter_raw_mode(&mut self) -> anyhow::Result<()> {
        use anyhow::Context;
        use nix::sys::termios::{self, SetArg};

        let Some(saved) = &self.saved else {
            return Ok(());
        };
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(std::io::stdin(), SetArg::TCSANOW, &raw)
            .context("Failed to put the terminal into raw mode")?;
        self.raw = true;
        Ok(())
    }
}

#[cfg(unix)]
impl Default for TerminalGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl Drop for TerminalGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};

        let (true, Some(saved)) = (self.raw, &self.saved) else {
            return;
        };
        // Let queued output reach the screen with raw settings first.
        if let Err(e) = termios::tcsetattr(std::io::stdin(), SetArg::TCSADRAIN, saved) {
            warn!("Failed to restore terminal settings: {}", e);
        }
    }
}

/// Stops the stdin reader thread; dropping it does the same.
pub struct StdinShutdown(Arc<AtomicBool>);

impl StdinShutdown {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Drop for StdinShutdown {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read process stdin on a blocking thread and expose it as an async stream.
///
/// End-of-file on stdin becomes end-of-file on the returned stream, and so
/// does any error reading stdin, after it is logged.
pub fn spawn_stdin_reader(buffer_size: usize) -> (DuplexStream, StdinShutdown) {
    let (chunks_tx, mut chunks_rx) = mpsc::channel::<Vec<u8>>(64);
    let stop = Arc::new(AtomicBool::new(false));
    let buffer_size = buffer_size.max(1);

    {
        let stop = stop.clone();
        std::thread::spawn(move || read_stdin(&stop, &chunks_tx, buffer_size));
    }

    let (client, mut server) = tokio::io::duplex(buffer_size);
    tokio::spawn(async move {
        while let Some(chunk) = chunks_rx.recv().await {
            if server.write_all(&chunk).await.is_err() {
                break;
            }
        }
        // Dropping `server` ends the client stream.
    });

    (client, StdinShutdown(stop))
}

fn read_stdin(stop: &AtomicBool, chunks: &mpsc::Sender<Vec<u8>>, buffer_size: usize) {
    let stdin = std::io::stdin();
    forward_chunks(
        stdin.lock(),
        || stdin_readable(&stdin),
        stop,
        chunks,
        buffer_size,
    );
    debug!("stdin reader thread exiting");
}

/// Copy `reader` into `chunks` until end-of-file, an error, a closed
/// receiver or `stop`. `readable` bounds each wait so `stop` is noticed.
fn forward_chunks<R: Read>(
    mut reader: R,
    mut readable: impl FnMut() -> std::io::Result<bool>,
    stop: &AtomicBool,
    chunks: &mpsc::Sender<Vec<u8>>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    while !stop.load(Ordering::Relaxed) {
        match readable() {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!("Polling stdin failed: {}", e);
                return;
            }
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                debug!("stdin reached end-of-file");
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Reading stdin failed: {}", e);
                return;
            }
        };
        if chunks.blocking_send(buf[..n].to_vec()).is_err() {
            return;
        }
    }
}

/// Waits up to `STDIN_POLL_MS` for stdin to become readable. Hang-up counts
/// as readable so the following read reports end-of-file.
#[cfg(unix)]
fn stdin_readable(stdin: &std::io::Stdin) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use std::os::fd::AsFd;

    let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(STDIN_POLL_MS)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn stdin_readable(_stdin: &std::io::Stdin) -> std::io::Result<bool> {
    Ok(true)
}

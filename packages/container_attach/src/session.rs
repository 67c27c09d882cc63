use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use container_lifecycle::{
    Container, ContainerRegistry, LifecycleError, OutputSubscription, StdinEndpoint,
};

use crate::error::AttachError;
use crate::escape::{DetachKeys, EscapeDetector};

/// Default size of each read from the client's input.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default time a session keeps writing output after its container stopped.
pub const DEFAULT_EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type ClientReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which container streams a session binds.
#[derive(Clone, Debug, Default)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// Terminal session: enables escape-sequence detach on stdin.
    pub tty: bool,
    /// Overrides the attacher's detach keys for this session.
    pub detach_keys: Option<DetachKeys>,
}

impl AttachOptions {
    /// All three streams, as an interactive client would ask for.
    pub fn interactive(tty: bool) -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            tty,
            detach_keys: None,
        }
    }

    pub fn mode(&self) -> SessionMode {
        if self.tty && self.stdin {
            SessionMode::Raw
        } else {
            SessionMode::Plain
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Input is scanned for the detach sequence.
    Raw,
    /// Bytes are copied verbatim; the session never detaches on its own.
    Plain,
}

/// The client's side of a session.
///
/// Without a separate error writer, container stderr is written to the
/// output writer.
#[derive(Default)]
pub struct ClientStreams {
    input: Option<ClientReader>,
    output: Option<ClientWriter>,
    error: Option<ClientWriter>,
}

impl ClientStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    pub fn with_output(mut self, output: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    pub fn with_error(mut self, error: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }
}

/// How an attach session ended.
#[derive(Debug)]
pub enum AttachOutcome {
    /// The client sent the detach sequence; the container keeps running.
    Detached,
    /// The container exited and its streams closed.
    Exited,
    /// The client went away or asked to disconnect; the container keeps running.
    Disconnected,
    /// A stream failed with no detach, disconnect or exit to explain it.
    Faulted(AttachError),
}

impl AttachOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Exited => "exited",
            Self::Disconnected => "disconnected",
            Self::Faulted(_) => "faulted",
        }
    }
}

/// Connects client streams to containers' stdio.
#[derive(Clone)]
pub struct StreamAttacher {
    registry: Arc<ContainerRegistry>,
    detach_keys: DetachKeys,
    read_buffer_size: usize,
    drain_timeout: Duration,
    next_session: Arc<AtomicU64>,
}

impl StreamAttacher {
    pub fn new(registry: Arc<ContainerRegistry>) -> Self {
        Self {
            registry,
            detach_keys: DetachKeys::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            drain_timeout: DEFAULT_EXIT_DRAIN_TIMEOUT,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_detach_keys(mut self, keys: DetachKeys) -> Self {
        self.detach_keys = keys;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// How long output may keep flowing to a client once the container has
    /// stopped, and how long shutting down a client writer may take.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn detach_keys(&self) -> &DetachKeys {
        &self.detach_keys
    }

    /// Attach to a running container by name, id or unique id prefix.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(
        &self,
        reference: &str,
        options: AttachOptions,
        client: ClientStreams,
    ) -> Result<AttachSession, AttachError> {
        let container = self.registry.get(reference)?;
        if !container.is_running() {
            return Err(LifecycleError::NotRunning(container.id().to_string()).into());
        }
        self.open(container, options, client)
    }

    /// Start a session without the running check, so a caller can subscribe
    /// before the container starts and miss no output.
    pub(crate) fn open(
        &self,
        container: Arc<Container>,
        options: AttachOptions,
        client: ClientStreams,
    ) -> Result<AttachSession, AttachError> {
        let ClientStreams {
            input,
            output,
            error,
        } = client;

        let input = match (options.stdin, input) {
            (true, Some(input)) => Some(input),
            (true, None) => return Err(AttachError::MissingClientStream("stdin")),
            (false, _) => None,
        };

        // In tty mode everything arrives on stdout.
        let want_stderr = options.stderr && !container.config().tty;
        if options.stdout && output.is_none() {
            return Err(AttachError::MissingClientStream("stdout"));
        }
        if want_stderr && output.is_none() && error.is_none() {
            return Err(AttachError::MissingClientStream("stderr"));
        }

        // Subscribe before any task runs so nothing published from here on is missed.
        let stdout = options.stdout.then(|| container.stdout().subscribe());
        let stderr = want_stderr.then(|| container.stderr().subscribe());
        let has_output = stdout.is_some() || stderr.is_some();

        let mode = options.mode();
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let disconnect_requested = Arc::new(AtomicBool::new(false));

        info!(
            "Session {} attached to container {} ({:?}, stdin={}, stdout={}, stderr={})",
            id,
            container.id().short(),
            mode,
            input.is_some(),
            stdout.is_some(),
            stderr.is_some()
        );

        let input_token = token.child_token();
        let input_task = input.map(|reader| {
            let detector = (mode == SessionMode::Raw).then(|| {
                EscapeDetector::new(
                    options
                        .detach_keys
                        .clone()
                        .unwrap_or_else(|| self.detach_keys.clone()),
                )
            });
            tokio::spawn(copy_input(
                reader,
                container.stdin().clone(),
                detector,
                input_token.clone(),
                self.read_buffer_size,
            ))
        });

        let output_token = token.child_token();
        let output_task = has_output.then(|| {
            let (out_writer, err_writer) = match (stdout.is_some(), output, error) {
                (true, out, err) => (out, err),
                // stderr only: without a separate error writer it uses the output writer
                (false, out, None) => (None, out),
                (false, _, err) => (None, err),
            };
            tokio::spawn(copy_output(
                stdout,
                stderr,
                out_writer,
                err_writer,
                output_token.clone(),
                self.drain_timeout,
            ))
        });

        let supervisor = Supervisor {
            id,
            container: container.clone(),
            session_token: token.clone(),
            input_token,
            output_token,
            disconnect_requested: disconnect_requested.clone(),
            drain_timeout: self.drain_timeout,
        };
        let task = tokio::spawn(supervisor.run(input_task, output_task));

        Ok(AttachSession {
            id,
            container,
            mode,
            token,
            disconnect_requested,
            task,
        })
    }
}

/// A live attach session.
pub struct AttachSession {
    id: u64,
    container: Arc<Container>,
    mode: SessionMode,
    token: CancellationToken,
    disconnect_requested: Arc<AtomicBool>,
    task: JoinHandle<AttachOutcome>,
}

impl AttachSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// End the session from the client side. The container is not touched.
    pub fn disconnect(&self) {
        self.disconnector().disconnect();
    }

    /// A handle that can end the session after `wait` has taken it.
    pub fn disconnector(&self) -> Disconnector {
        Disconnector {
            token: self.token.clone(),
            requested: self.disconnect_requested.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> AttachOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => AttachOutcome::Faulted(AttachError::Task(e.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct Disconnector {
    token: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl Disconnector {
    pub fn disconnect(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

enum InputEnd {
    /// Client input reached end-of-file.
    Eof,
    Detached,
    /// Container stdin closed underneath us.
    StdinClosed,
    Cancelled,
    Failed(std::io::Error),
}

enum OutputEnd {
    /// Every bound container stream reached end-of-stream.
    Closed,
    Cancelled,
    Failed(std::io::Error),
}

async fn copy_input(
    mut reader: ClientReader,
    stdin: StdinEndpoint,
    mut detector: Option<EscapeDetector>,
    token: CancellationToken,
    buffer_size: usize,
) -> InputEnd {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return InputEnd::Cancelled,
            read = reader.read(&mut buffer) => read,
        };

        let (chunk, end) = match read {
            Ok(0) => {
                let mut rest = Vec::new();
                if let Some(detector) = detector.as_mut() {
                    detector.finish(&mut rest);
                }
                (rest, Some(InputEnd::Eof))
            }
            Ok(n) => match detector.as_mut() {
                Some(detector) => {
                    let mut forward = Vec::with_capacity(n);
                    let detached = detector.feed(&buffer[..n], &mut forward).is_some();
                    (forward, detached.then_some(InputEnd::Detached))
                }
                None => (buffer[..n].to_vec(), None),
            },
            Err(e) => return InputEnd::Failed(e),
        };

        if !chunk.is_empty() {
            let written = tokio::select! {
                biased;
                _ = token.cancelled() => return InputEnd::Cancelled,
                written = stdin.write(chunk) => written,
            };
            if written.is_err() {
                return InputEnd::StdinClosed;
            }
        }
        if let Some(end) = end {
            return end;
        }
    }
}

async fn copy_output(
    mut stdout: Option<OutputSubscription>,
    mut stderr: Option<OutputSubscription>,
    mut out_writer: Option<ClientWriter>,
    mut err_writer: Option<ClientWriter>,
    token: CancellationToken,
    shutdown_timeout: Duration,
) -> OutputEnd {
    let end = loop {
        let (chunk, to_err) = tokio::select! {
            biased;
            _ = token.cancelled() => break OutputEnd::Cancelled,
            chunk = recv(&mut stdout), if stdout.is_some() => (chunk, false),
            chunk = recv(&mut stderr), if stderr.is_some() => (chunk, true),
            else => break OutputEnd::Closed,
        };

        let Some(chunk) = chunk else {
            if to_err {
                stderr = None;
            } else {
                stdout = None;
            }
            continue;
        };

        let writer = if to_err {
            err_writer.as_mut().or(out_writer.as_mut())
        } else {
            out_writer.as_mut()
        };
        let Some(writer) = writer else {
            continue;
        };
        // A client that stops reading must not pin the session open.
        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break OutputEnd::Cancelled,
            written = write_chunk(writer, &chunk) => written,
        };
        if let Err(e) = written {
            break OutputEnd::Failed(e);
        }
    };

    for writer in [out_writer.as_mut(), err_writer.as_mut()].into_iter().flatten() {
        if tokio::time::timeout(shutdown_timeout, writer.shutdown())
            .await
            .is_err()
        {
            debug!("Client writer did not shut down within {:?}", shutdown_timeout);
        }
    }
    end
}

async fn recv(subscription: &mut Option<OutputSubscription>) -> Option<Vec<u8>> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => None,
    }
}

async fn write_chunk(writer: &mut ClientWriter, chunk: &[u8]) -> std::io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Owns the per-session tasks and turns how they ended into one outcome.
struct Supervisor {
    id: u64,
    container: Arc<Container>,
    session_token: CancellationToken,
    input_token: CancellationToken,
    output_token: CancellationToken,
    disconnect_requested: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl Supervisor {
    async fn run(
        self,
        mut input: Option<JoinHandle<InputEnd>>,
        mut output: Option<JoinHandle<OutputEnd>>,
    ) -> AttachOutcome {
        let stdin_once = self.container.config().stdin_once;
        let mut outcome: Option<AttachOutcome> = None;
        let mut input_eof = false;
        // Set once the container stopped while output was still being written.
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if input.is_none() && output.is_none() && outcome.is_some() {
                break;
            }
            tokio::select! {
                end = join(&mut input), if input.is_some() => {
                    input = None;
                    match end {
                        Ok(InputEnd::Detached) => {
                            info!("Session {} detached from container {}", self.id, self.container.id().short());
                            outcome.get_or_insert(AttachOutcome::Detached);
                            self.output_token.cancel();
                        }
                        Ok(InputEnd::Eof) => {
                            debug!("Session {} client input ended", self.id);
                            input_eof = true;
                            if stdin_once {
                                // Output keeps flowing until the container reacts to EOF.
                                self.container.close_stdin();
                                if output.is_none() {
                                    outcome.get_or_insert(AttachOutcome::Disconnected);
                                }
                            } else {
                                // The client has gone; its output goes with it.
                                outcome.get_or_insert(AttachOutcome::Disconnected);
                                self.output_token.cancel();
                            }
                        }
                        // The container is going away; its exit decides the outcome.
                        Ok(InputEnd::StdinClosed) | Ok(InputEnd::Cancelled) => {}
                        Ok(InputEnd::Failed(e)) => {
                            if outcome.is_none() && !self.disconnect_requested() {
                                warn!("Session {} client input failed: {}", self.id, e);
                                outcome = Some(AttachOutcome::Faulted(e.into()));
                            }
                            self.output_token.cancel();
                        }
                        Err(e) => {
                            outcome.get_or_insert(AttachOutcome::Faulted(AttachError::Task(e.to_string())));
                            self.output_token.cancel();
                        }
                    }
                }
                end = join(&mut output), if output.is_some() => {
                    output = None;
                    match end {
                        Ok(OutputEnd::Closed) => {
                            outcome.get_or_insert(AttachOutcome::Exited);
                        }
                        Ok(OutputEnd::Cancelled) => {}
                        Ok(OutputEnd::Failed(e)) => {
                            if outcome.is_none() {
                                outcome = Some(if self.disconnect_requested() || input_eof {
                                    AttachOutcome::Disconnected
                                } else {
                                    warn!("Session {} client output failed: {}", self.id, e);
                                    AttachOutcome::Faulted(e.into())
                                });
                            }
                        }
                        Err(e) => {
                            outcome.get_or_insert(AttachOutcome::Faulted(AttachError::Task(e.to_string())));
                        }
                    }
                    self.input_token.cancel();
                }
                // Without an output stream, exit is only visible through the state signal.
                _ = self.container.stopped(), if output.is_none() && outcome.is_none() => {
                    outcome = Some(AttachOutcome::Exited);
                    self.input_token.cancel();
                }
                _ = self.container.stopped(), if output.is_some() && outcome.is_none() && drain_deadline.is_none() => {
                    drain_deadline = Some(Instant::now() + self.drain_timeout);
                }
                _ = deadline(drain_deadline), if output.is_some() && outcome.is_none() => {
                    warn!("Session {} client is not reading, dropping remaining output", self.id);
                    outcome = Some(AttachOutcome::Exited);
                    self.output_token.cancel();
                    self.input_token.cancel();
                }
                _ = self.session_token.cancelled(), if outcome.is_none() => {
                    outcome = Some(AttachOutcome::Disconnected);
                }
            }
        }

        let outcome = outcome.unwrap_or(AttachOutcome::Disconnected);
        info!(
            "Session {} on container {} ended: {}",
            self.id,
            self.container.id().short(),
            outcome.as_str()
        );
        outcome
    }

    fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::SeqCst)
    }
}

use std::sync::Arc;
use tracing::{info, warn};

use container_lifecycle::{
    CommandDriver, Container, ContainerConfig, ContainerId, ContainerRegistry, IdResolver, LifecycleMonitor,
    ProcessDriver, PtyDriver,
};

use crate::config::BerthConfig;
use crate::error::AttachError;
use crate::session::{AttachOptions, AttachOutcome, ClientStreams, StreamAttacher};

/// How `Runtime::run` should treat the new container.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Streams to attach in the foreground.
    pub attach: AttachOptions,
    /// Start in the background and return the id instead of attaching.
    pub detach: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Started detached; the container's full id.
    Background(ContainerId),
    Foreground {
        container: Arc<Container>,
        outcome: AttachOutcome,
        /// Set when the session ended because the container exited.
        exit_code: Option<i32>,
    },
}

/// Lifecycle monitor and stream attacher sharing one registry.
pub struct Runtime {
    monitor: Arc<LifecycleMonitor>,
    attacher: StreamAttacher,
}

impl Runtime {
    pub fn new(monitor: Arc<LifecycleMonitor>, attacher: StreamAttacher) -> Self {
        Self { monitor, attacher }
    }

    /// Build a runtime around one process driver, see `driver_for`.
    pub fn from_config(config: &BerthConfig, driver: Arc<dyn ProcessDriver>) -> Self {
        let registry = Arc::new(ContainerRegistry::new(IdResolver::new(
            config.runtime.min_prefix_len,
        )));
        let monitor = LifecycleMonitor::new(registry.clone(), driver)
            .with_buffers(config.runtime.output_buffer, config.runtime.stdin_buffer);
        let attacher = StreamAttacher::new(registry)
            .with_detach_keys(config.attach.detach_keys.clone())
            .with_read_buffer_size(config.runtime.read_buffer_size)
            .with_drain_timeout(config.runtime.drain_timeout());
        Self::new(Arc::new(monitor), attacher)
    }

    /// The process driver matching a run's terminal setting.
    pub fn driver_for(config: &BerthConfig, tty: bool) -> Arc<dyn ProcessDriver> {
        let drain = config.runtime.drain_timeout();
        let read = config.runtime.read_buffer_size;
        if tty {
            Arc::new(PtyDriver::new(drain, read).with_raw_mode(true))
        } else {
            Arc::new(CommandDriver::new(drain, read))
        }
    }

    pub fn monitor(&self) -> &Arc<LifecycleMonitor> {
        &self.monitor
    }

    pub fn attacher(&self) -> &StreamAttacher {
        &self.attacher
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        self.monitor.registry()
    }

    /// Create, attach and start a container.
    ///
    /// The session subscribes before the process starts, so early output is
    /// never lost. In detached mode nothing is attached and the id is
    /// returned as soon as the container is running.
    pub async fn run(
        &self,
        config: ContainerConfig,
        options: RunOptions,
        client: ClientStreams,
    ) -> Result<RunOutcome, AttachError> {
        let container = self.monitor.create(config)?;
        let id = container.id().clone();

        if options.detach {
            self.monitor.start(&container)?;
            info!("Started container {} in the background", id.short());
            return Ok(RunOutcome::Background(id));
        }

        let session = match self.attacher.open(container.clone(), options.attach, client) {
            Ok(session) => session,
            Err(e) => {
                if let Err(discard) = self.monitor.discard(&container) {
                    warn!("Failed to discard container {}: {}", id.short(), discard);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.monitor.start(&container) {
            session.disconnect();
            let _ = session.wait().await;
            return Err(e.into());
        }

        let outcome = session.wait().await;
        let exit_code = match outcome {
            AttachOutcome::Exited => match container.wait_stop(None).await {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!("Lost exit code of container {}: {}", id.short(), e);
                    None
                }
            },
            _ => None,
        };

        Ok(RunOutcome::Foreground {
            container,
            outcome,
            exit_code,
        })
    }
}

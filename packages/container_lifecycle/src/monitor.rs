use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::container::{Container, ContainerConfig, ContainerState};
use crate::driver::{ProcessDriver, ProcessStdio, SPAWN_FAILED_EXIT_CODE, UNKNOWN_EXIT_CODE};
use crate::error::LifecycleError;
use crate::ids::ContainerId;
use crate::registry::ContainerRegistry;

/// Default number of chunks buffered per output subscriber.
pub const DEFAULT_OUTPUT_BUFFER: usize = 1024;

/// Default number of chunks queued for container stdin.
pub const DEFAULT_STDIN_BUFFER: usize = 64;

/// Creates containers and owns every state transition they go through.
pub struct LifecycleMonitor {
    registry: Arc<ContainerRegistry>,
    driver: Arc<dyn ProcessDriver>,
    output_buffer: usize,
    stdin_buffer: usize,
}

impl LifecycleMonitor {
    pub fn new(registry: Arc<ContainerRegistry>, driver: Arc<dyn ProcessDriver>) -> Self {
        Self {
            registry,
            driver,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            stdin_buffer: DEFAULT_STDIN_BUFFER,
        }
    }

    pub fn with_buffers(mut self, output_buffer: usize, stdin_buffer: usize) -> Self {
        self.output_buffer = output_buffer;
        self.stdin_buffer = stdin_buffer;
        self
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    /// Register a new container in the `Created` state.
    pub fn create(&self, config: ContainerConfig) -> Result<Arc<Container>, LifecycleError> {
        let container = Arc::new(Container::new(
            ContainerId::generate(),
            config,
            self.stdin_buffer,
            self.output_buffer,
        ));
        self.registry.add(container.clone())?;
        info!(
            "Created container {} ({})",
            container.id().short(),
            container.config().process.command
        );
        Ok(container)
    }

    /// `Created → Running`.
    ///
    /// Spawns the process and a watcher task that performs `Running → Stopped`
    /// exactly once. A process that cannot be spawned moves the container
    /// straight to `Stopped` with exit code 127.
    pub fn start(&self, container: &Arc<Container>) -> Result<(), LifecycleError> {
        let stdin = container
            .take_stdin_receiver()
            .ok_or_else(|| LifecycleError::AlreadyStarted(container.id().to_string()))?;

        let stdio = ProcessStdio {
            stdin,
            stdout: container.stdout().clone(),
            stderr: container.stderr().clone(),
        };

        let spawned = match self.driver.spawn(container.config(), stdio) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to start container {}: {}", container.id().short(), e);
                finish(&self.registry, container, SPAWN_FAILED_EXIT_CODE);
                return Err(e);
            }
        };

        info!(
            "Container {} running with PID: {:?}",
            container.id().short(),
            spawned.pid
        );
        container.mark_running(spawned.pid, spawned.signaller);

        let registry = self.registry.clone();
        let watched = container.clone();
        let exit = spawned.exit;
        tokio::spawn(async move {
            let exit_code = match exit.await {
                Ok(code) => code,
                Err(_) => {
                    warn!(
                        "Driver for container {} went away without an exit code",
                        watched.id().short()
                    );
                    UNKNOWN_EXIT_CODE
                }
            };
            finish(&registry, &watched, exit_code);
        });

        Ok(())
    }

    /// Resolve a reference and start that container.
    pub fn start_ref(&self, reference: &str) -> Result<Arc<Container>, LifecycleError> {
        let container = self.registry.get(reference)?;
        self.start(&container)?;
        Ok(container)
    }

    /// `Stopped → Removed`, at most once.
    pub fn remove(&self, container: &Container) -> Result<(), LifecycleError> {
        match container.state() {
            ContainerState::Stopped { .. } => {
                if !container.mark_removed() {
                    return Err(LifecycleError::NotFound(container.id().to_string()));
                }
                self.registry.remove(container.id());
                info!("Removed container {}", container.id().short());
                Ok(())
            }
            ContainerState::Removed => Err(LifecycleError::NotFound(container.id().to_string())),
            ContainerState::Created | ContainerState::Running => {
                Err(LifecycleError::NotStopped(container.id().to_string()))
            }
        }
    }

    /// `Created → Removed` for a container that will never be started.
    pub fn discard(&self, container: &Container) -> Result<(), LifecycleError> {
        if !container.mark_discarded() {
            return Err(match container.state() {
                ContainerState::Removed => LifecycleError::NotFound(container.id().to_string()),
                _ => LifecycleError::AlreadyStarted(container.id().to_string()),
            });
        }
        self.registry.remove(container.id());
        info!("Discarded container {}", container.id().short());
        Ok(())
    }
}

/// The single `→ Stopped` transition, cascading to `Removed` under auto-remove
/// before any `wait_stop` caller is released.
fn finish(registry: &ContainerRegistry, container: &Container, exit_code: i32) {
    if !container.mark_stopped(exit_code) {
        debug!("Container {} already stopped", container.id().short());
        return;
    }
    info!(
        "Container {} stopped with exit code {}",
        container.id().short(),
        exit_code
    );

    if container.config().auto_remove {
        registry.remove(container.id());
        container.mark_removed();
        info!("Auto-removed container {}", container.id().short());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ProcessSpec;
    use crate::signal::StopSignal;
    use crate::test_util::{EchoDriver, ExitDriver, FailingDriver};
    use std::time::Duration;

    fn monitor(driver: impl ProcessDriver + 'static) -> LifecycleMonitor {
        LifecycleMonitor::new(Arc::new(ContainerRegistry::default()), Arc::new(driver))
    }

    fn config() -> ContainerConfig {
        ContainerConfig::new(ProcessSpec::new("cat"))
    }

    #[tokio::test]
    async fn start_runs_and_signals_readiness() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        assert_eq!(c.state(), ContainerState::Created);

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_running().await })
        };
        monitor.start(&c).unwrap();
        waiter.await.unwrap().unwrap();
        assert!(c.is_running());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        monitor.start(&c).unwrap();
        assert!(matches!(
            monitor.start(&c),
            Err(LifecycleError::AlreadyStarted(_))
        ));
        assert!(c.is_running());
    }

    #[tokio::test]
    async fn kill_stops_asynchronously_with_signal_exit_code() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        monitor.start(&c).unwrap();

        c.kill(StopSignal::Kill).unwrap();
        let code = c.wait_stop(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(code, 137);
        assert_eq!(c.state(), ContainerState::Stopped { exit_code: 137 });
        assert!(matches!(
            c.kill(StopSignal::Kill),
            Err(LifecycleError::NotRunning(_))
        ));
        // Still listed without auto-remove.
        assert!(monitor.registry().contains(c.id()));
    }

    #[tokio::test]
    async fn wait_stop_timeout_leaves_container_running() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        monitor.start(&c).unwrap();

        let err = c
            .wait_stop(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err, LifecycleError::Timeout(Duration::from_millis(50)));
        assert!(c.is_running());
        c.kill(StopSignal::Term).unwrap();
        assert_eq!(c.wait_stop(None).await.unwrap(), 143);
    }

    #[tokio::test]
    async fn unbounded_wait_on_exited_container_returns_immediately() {
        let monitor = monitor(ExitDriver::new(7));
        let c = monitor.create(config()).unwrap();
        monitor.start(&c).unwrap();
        c.stopped().await;

        let code = tokio::time::timeout(Duration::from_millis(100), c.wait_stop(None))
            .await
            .expect("wait_stop blocked on a stopped container")
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn all_waiters_woken_by_one_transition() {
        let monitor = monitor(ExitDriver::new(0).after(Duration::from_millis(50)));
        let c = monitor.create(config()).unwrap();
        monitor.start(&c).unwrap();

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let c = c.clone();
                tokio::spawn(async move { c.wait_stop(None).await })
            })
            .collect();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(0));
        }
    }

    #[tokio::test]
    async fn auto_remove_unlists_before_waiters_return() {
        let monitor = monitor(ExitDriver::new(0).after(Duration::from_millis(20)));
        let c = monitor
            .create(ContainerConfig {
                auto_remove: true,
                ..config()
            })
            .unwrap();
        let id = c.id().clone();
        monitor.start(&c).unwrap();

        let registry = monitor.registry().clone();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let c = c.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    let code = c.wait_stop(None).await;
                    (code, registry.contains(c.id()))
                })
            })
            .collect();
        for waiter in waiters {
            let (code, listed) = waiter.await.unwrap();
            assert_eq!(code, Ok(0));
            assert!(!listed);
        }
        assert_eq!(c.state(), ContainerState::Removed);
        assert!(registry.list().iter().all(|other| other.id() != &id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn remove_only_after_stop_and_only_once() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        assert!(matches!(
            monitor.remove(&c),
            Err(LifecycleError::NotStopped(_))
        ));
        monitor.start(&c).unwrap();
        assert!(matches!(
            monitor.remove(&c),
            Err(LifecycleError::NotStopped(_))
        ));

        c.kill(StopSignal::Kill).unwrap();
        c.wait_stop(None).await.unwrap();
        monitor.remove(&c).unwrap();
        assert_eq!(c.state(), ContainerState::Removed);
        assert!(monitor.registry().is_empty());
        assert!(matches!(
            monitor.remove(&c),
            Err(LifecycleError::NotFound(_))
        ));
        // Exit code survives removal.
        assert_eq!(c.wait_stop(Some(Duration::ZERO)).await, Ok(137));
    }

    #[tokio::test]
    async fn discard_removes_a_never_started_container() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        let mut out = c.stdout().subscribe();

        monitor.discard(&c).unwrap();
        assert_eq!(c.state(), ContainerState::Removed);
        assert!(monitor.registry().is_empty());
        assert!(out.recv().await.is_none());
        assert!(matches!(
            monitor.start(&c),
            Err(LifecycleError::AlreadyStarted(_))
        ));
        assert!(matches!(
            monitor.discard(&c),
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn discard_refuses_a_started_container() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        monitor.start(&c).unwrap();
        assert!(matches!(
            monitor.discard(&c),
            Err(LifecycleError::AlreadyStarted(_))
        ));
        assert!(c.is_running());
        assert!(monitor.registry().contains(c.id()));
    }

    #[tokio::test]
    async fn spawn_failure_stops_container() {
        let monitor = monitor(FailingDriver);
        let c = monitor.create(config()).unwrap();
        assert!(matches!(
            monitor.start(&c),
            Err(LifecycleError::SpawnFailed(_))
        ));
        assert_eq!(
            c.state(),
            ContainerState::Stopped {
                exit_code: SPAWN_FAILED_EXIT_CODE
            }
        );
        assert!(matches!(
            c.wait_running().await,
            Err(LifecycleError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn exit_closes_output_for_subscribers() {
        let monitor = monitor(ExitDriver::new(0).with_output(b"bye\n"));
        let c = monitor.create(config()).unwrap();
        let mut out = c.stdout().subscribe();
        monitor.start(&c).unwrap();

        let mut received = Vec::new();
        while let Some(chunk) = tokio::time::timeout(Duration::from_secs(2), out.recv())
            .await
            .expect("subscriber never saw end-of-stream")
        {
            received.extend(chunk);
        }
        assert_eq!(received, b"bye\n");
        assert!(c.stdout().is_closed());
        // A second close from another cleanup path is harmless.
        assert!(!c.stdout().close());
    }

    #[tokio::test]
    async fn start_ref_resolves_prefix() {
        let monitor = monitor(EchoDriver::default());
        let c = monitor.create(config()).unwrap();
        let started = monitor.start_ref(&c.id().as_str()[..8]).unwrap();
        assert_eq!(started.id(), c.id());
        assert!(started.is_running());
    }
}

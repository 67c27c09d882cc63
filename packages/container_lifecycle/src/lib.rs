//! Container lifecycle - run-state tracking for an interactive container runtime
//!
//! This crate owns each container's `Created → Running → Stopped → Removed`
//! state machine, its three stdio endpoints, and the registry other subsystems
//! look containers up in. It has no knowledge of attach sessions or terminals;
//! those live in `container_attach`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use container_lifecycle::{
//!     CommandDriver, ContainerConfig, ContainerRegistry, LifecycleMonitor, ProcessSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(ContainerRegistry::default());
//!     let monitor = LifecycleMonitor::new(registry, Arc::new(CommandDriver::default()));
//!
//!     let container = monitor
//!         .create(ContainerConfig::new(ProcessSpec::new("echo").arg("hello")))
//!         .unwrap();
//!     let mut output = container.stdout().subscribe();
//!     monitor.start(&container).unwrap();
//!
//!     while let Some(chunk) = output.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//!     let exit_code = container.wait_stop(None).await.unwrap();
//!     println!("container {} exited with {}", container.id().short(), exit_code);
//! }
//! ```

mod command;
mod container;
mod driver;
mod error;
mod ids;
mod monitor;
mod pty;
mod registry;
mod signal;
mod stdio;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use command::{CommandDriver, DEFAULT_DRAIN_TIMEOUT, DEFAULT_READ_BUFFER_SIZE};
pub use container::{Container, ContainerConfig, ContainerInfo, ContainerState, ProcessSpec};
pub use driver::{
    PidSignaller, ProcessDriver, ProcessStdio, SPAWN_FAILED_EXIT_CODE, Signaller, SpawnedProcess,
    UNKNOWN_EXIT_CODE,
};
pub use error::LifecycleError;
pub use ids::{ContainerId, DEFAULT_MIN_PREFIX_LEN, IdResolver, SHORT_ID_LEN, truncate_id};
pub use monitor::{DEFAULT_OUTPUT_BUFFER, DEFAULT_STDIN_BUFFER, LifecycleMonitor};
pub use pty::PtyDriver;
pub use registry::ContainerRegistry;
pub use signal::{StopSignal, deliver};
pub use stdio::{OutputEndpoint, OutputSubscription, StdinEndpoint};

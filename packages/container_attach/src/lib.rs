//! Container attach - interactive sessions on top of `container_lifecycle`
//!
//! A session copies bytes between a client's streams and a running
//! container's stdio. Terminal sessions scan client input for a detach
//! sequence (Ctrl-P Ctrl-Q by default) that ends the session while leaving the
//! container running.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use container_attach::{AttachOptions, ClientStreams, StreamAttacher};
//! use container_lifecycle::ContainerRegistry;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(ContainerRegistry::default());
//!     // ... containers are created and started through a LifecycleMonitor ...
//!
//!     let attacher = StreamAttacher::new(registry);
//!     let client = ClientStreams::new()
//!         .with_input(tokio::io::stdin())
//!         .with_output(tokio::io::stdout())
//!         .with_error(tokio::io::stderr());
//!     let session = attacher
//!         .attach("abcd", AttachOptions::interactive(true), client)
//!         .unwrap();
//!     println!("session ended: {}", session.wait().await.as_str());
//! }
//! ```

pub mod config;
mod error;
pub mod escape;
mod run;
mod session;
pub mod terminal;

pub use config::{BerthConfig, load_config};
pub use error::AttachError;
pub use escape::{DetachEvent, DetachKeys, EscapeDetector};
pub use run::{RunOptions, RunOutcome, Runtime};
pub use session::{
    AttachOptions, AttachOutcome, AttachSession, ClientReader, ClientStreams, ClientWriter,
    DEFAULT_EXIT_DRAIN_TIMEOUT, DEFAULT_READ_BUFFER_SIZE, Disconnector, SessionMode, StreamAttacher,
};

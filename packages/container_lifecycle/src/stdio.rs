//! Container-side stream endpoints.
//!
//! Endpoints are created together with the container and shared by every
//! attach session. Only the lifecycle monitor closes them; closing is
//! idempotent and wakes every blocked reader with end-of-stream.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::LifecycleError;

/// Write side of a container's stdin.
///
/// Writers are not arbitrated: chunks from concurrent writers interleave in
/// the order they reach the channel.
#[derive(Clone, Debug)]
pub struct StdinEndpoint {
    tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl StdinEndpoint {
    /// Create the endpoint and the receiver the process driver drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Queue bytes for the container's stdin.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), LifecycleError> {
        // Clone outside the await so a concurrent close is never blocked on us.
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(LifecycleError::ClosedStream("stdin"))?;
        tx.send(data)
            .await
            .map_err(|_| LifecycleError::ClosedStream("stdin"))
    }

    /// Returns true if this call performed the close.
    pub fn close(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

/// Fan-out endpoint for a container's stdout or stderr.
///
/// Every subscriber owns a bounded queue. Publishing waits for room in each
/// queue, so a slow reader slows the publisher down instead of losing
/// chunks. A subscriber that goes away stops counting.
#[derive(Clone, Debug)]
pub struct OutputEndpoint {
    name: &'static str,
    capacity: usize,
    subscribers: Arc<Mutex<Option<Vec<mpsc::Sender<Vec<u8>>>>>>,
}

impl OutputEndpoint {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Live subscribers, or `None` once the endpoint is closed.
    fn senders(&self) -> Option<Vec<mpsc::Sender<Vec<u8>>>> {
        let mut guard = self.subscribers.lock();
        let senders = guard.as_mut()?;
        senders.retain(|tx| !tx.is_closed());
        Some(senders.clone())
    }

    /// Publish a chunk to every current subscriber, waiting while any of
    /// their queues is full.
    ///
    /// Returns false once the endpoint is closed. Having no subscribers is not
    /// an error: output nobody is attached to is dropped.
    pub async fn publish(&self, data: Vec<u8>) -> bool {
        let Some(senders) = self.senders() else {
            return false;
        };
        for tx in senders {
            if tx.send(data.clone()).await.is_err() {
                trace!("{} subscriber went away", self.name);
            }
        }
        true
    }

    /// `publish` for threads outside the runtime. Panics if called from
    /// async code.
    pub fn blocking_publish(&self, data: Vec<u8>) -> bool {
        let Some(senders) = self.senders() else {
            return false;
        };
        for tx in senders {
            if tx.blocking_send(data.clone()).is_err() {
                trace!("{} subscriber went away", self.name);
            }
        }
        true
    }

    /// Subscribe to chunks published from now on.
    ///
    /// Subscribing to a closed endpoint yields a subscription that is already
    /// at end-of-stream.
    pub fn subscribe(&self) -> OutputSubscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let rx = match self.subscribers.lock().as_mut() {
            Some(senders) => {
                senders.push(tx);
                Some(rx)
            }
            None => None,
        };
        OutputSubscription { rx }
    }

    /// Returns true if this call performed the close.
    ///
    /// Chunks already queued are still delivered before end-of-stream.
    pub fn close(&self) -> bool {
        self.subscribers.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().is_none()
    }
}

/// One reader's view of an `OutputEndpoint`.
///
/// Dropping the subscription releases a publisher blocked on its queue.
#[derive(Debug)]
pub struct OutputSubscription {
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl OutputSubscription {
    /// Next chunk, or `None` once the endpoint is closed and drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let rx = self.rx.as_mut()?;
        let chunk = rx.recv().await;
        if chunk.is_none() {
            self.rx = None;
        }
        chunk
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }
}

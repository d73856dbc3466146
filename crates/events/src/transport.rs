//! Outbound message transport abstraction (mechanics only).
//!
//! The core only needs one operation from a broker client:
//! `publish(topic, payload) -> ok | error`. Everything else about the broker
//! (partitions, acks, consumer groups) stays on the other side of this trait.
//!
//! ## Delivery semantics
//!
//! - **One attempt per call**: implementations must not retry internally; the
//!   caller decides what a failure means (the publisher turns it into a durable
//!   failure record).
//! - **Bounded**: a publish that does not complete within the configured timeout
//!   is a failure, never left pending. [`TimeoutTransport`] enforces this for
//!   clients that cannot bound themselves, and caps how many abandoned calls
//!   may pile up behind a hung broker.
//! - **At-least-once**: a timed-out call may still land at the broker later, so
//!   a replay can produce a duplicate. Consumers must be idempotent on
//!   `event_id`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Transport-level publish failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Broker unreachable, connection refused, client shut down.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The publish did not complete within the allotted time.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The broker answered but refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Message transport client (pub side only).
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`; the publisher calls it from whichever
/// thread committed the transaction and from the retry worker concurrently.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        (**self).publish(topic, payload)
    }
}

/// Default cap on inner calls running at once, timed-out ones included.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Enforces a deadline on every publish of the wrapped transport.
///
/// The inner call runs on a short-lived thread; the caller waits at most
/// `timeout` for its result. A call that overruns is reported as
/// [`TransportError::Timeout`] and its eventual result is discarded.
///
/// An overrunning call keeps its thread until the inner client returns. At
/// most `max_in_flight` such calls exist at once; beyond that, publishes fail
/// fast with [`TransportError::Unavailable`] without spawning anything.
/// Clones share the in-flight count.
#[derive(Clone)]
pub struct TimeoutTransport {
    inner: Arc<dyn Transport>,
    timeout: Duration,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

impl TimeoutTransport {
    pub fn new(inner: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the in-flight cap (at least 1).
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Inner calls that have not returned yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn acquire_slot(&self) -> Option<InFlightSlot> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .ok()
            .map(|_| InFlightSlot(Arc::clone(&self.in_flight)))
    }
}

/// Releases one in-flight slot when the inner call is over.
struct InFlightSlot(Arc<AtomicUsize>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl core::fmt::Debug for TimeoutTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimeoutTransport")
            .field("timeout", &self.timeout)
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Transport for TimeoutTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let Some(slot) = self.acquire_slot() else {
            return Err(TransportError::Unavailable(format!(
                "{} publishes still in flight",
                self.max_in_flight
            )));
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let inner = Arc::clone(&self.inner);
        let topic = topic.to_string();
        let payload = payload.to_vec();

        thread::Builder::new()
            .name("transport-publish".to_string())
            .spawn(move || {
                let result = inner.publish(&topic, &payload);
                drop(slot);
                // Receiver may be gone after a timeout; nothing left to report to.
                let _ = tx.send(result);
            })
            .map_err(|e| TransportError::Unavailable(format!("failed to spawn publish thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(TransportError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Unavailable(
                "publish thread terminated without a result".to_string(),
            )),
        }
    }
}

/// A subscription to messages accepted by an in-process transport.
///
/// Mostly useful in tests and dev wiring where a consumer wants to observe
/// what was delivered.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

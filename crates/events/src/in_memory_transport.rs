//! In-memory transport for tests/dev.
//!
//! Records every accepted message, fans it out to subscribers, and lets tests
//! take the "broker" down, fail a fixed number of calls, or add latency.

use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::transport::{Subscription, Transport, TransportError};

/// A message accepted by the in-memory transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    available: bool,
    fail_next: u32,
    latency: Duration,
    attempts: u64,
    published: Vec<PublishedMessage>,
    subscribers: Vec<mpsc::Sender<PublishedMessage>>,
}

/// In-memory broker stand-in.
///
/// - No IO
/// - Healthy by default
/// - Failure injection is global to the instance
#[derive(Debug)]
pub struct InMemoryTransport {
    state: Mutex<State>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Test double: a panicking subscriber must not wedge the transport.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the broker up or down. While down every publish fails.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Fail the next `n` publishes, then recover.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Delay every publish by `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Number of publish calls seen, successful or not.
    pub fn attempts(&self) -> u64 {
        self.state().attempts
    }

    /// All accepted messages, in acceptance order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Accepted messages for one topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> Subscription<PublishedMessage> {
        let (tx, rx) = mpsc::channel();
        self.state().subscribers.push(tx);
        Subscription::new(rx)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                available: true,
                ..State::default()
            }),
        }
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let latency = {
            let mut state = self.state();
            state.attempts += 1;
            state.latency
        };

        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let mut state = self.state();
        if !state.available {
            return Err(TransportError::Unavailable("broker is down".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Unavailable("injected failure".to_string()));
        }

        let message = PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };

        // Drop any dead subscribers while publishing.
        state.subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        state.published.push(message);
        debug!(topic, bytes = payload.len(), "in-memory transport accepted message");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_transport_records_and_fans_out() {
        let transport = InMemoryTransport::new();
        let sub = transport.subscribe();

        transport.publish("orders", b"one").unwrap();

        assert_eq!(transport.published_to("orders").len(), 1);
        let got = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.payload, b"one".to_vec());
    }

    #[test]
    fn down_transport_rejects_and_records_nothing() {
        let transport = InMemoryTransport::new();
        transport.set_available(false);

        assert!(matches!(
            transport.publish("orders", b"x"),
            Err(TransportError::Unavailable(_))
        ));
        assert!(transport.published().is_empty());
        assert_eq!(transport.attempts(), 1);
    }

    #[test]
    fn fail_next_recovers_after_budget() {
        let transport = InMemoryTransport::new();
        transport.fail_next(2);

        assert!(transport.publish("t", b"1").is_err());
        assert!(transport.publish("t", b"2").is_err());
        assert!(transport.publish("t", b"3").is_ok());
        assert_eq!(transport.published().len(), 1);
    }
}

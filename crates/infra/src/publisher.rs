//! Post-commit event publication.
//!
//! Events are raised into a [`Transaction`] as serialized envelopes and only
//! reach the transport after that transaction commits. Each committed event
//! gets exactly one transport attempt, bounded by the configured timeout:
//!
//! - **Delivered**: done (plus an optional best-effort success notice).
//! - **Failed**: recorded by the [`FailureTracker`] before `publish_committed`
//!   returns, for the retry scheduler to replay. The business caller never
//!   sees the failure.
//!
//! Replays go through [`EventPublisher::replay`], which sends the stored bytes
//! unchanged to the stored topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use stockflow_events::{
    DEFAULT_MAX_IN_FLIGHT, Event, EventEnvelope, TimeoutTransport, Transport, TransportError,
};

use crate::failures::{FailureRecord, FailureStoreError, FailureTracker, NewFailure};
use crate::transaction::{PendingEvent, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Topic for events without an override.
    pub default_topic: String,
    /// Per-event-type topic overrides.
    pub topic_overrides: HashMap<String, String>,
    /// Optional topic for "published" notices.
    pub success_topic: Option<String>,
    /// Optional topic for "publication failed" notices.
    pub failure_topic: Option<String>,
    /// Upper bound for one transport call.
    pub publish_timeout: Duration,
    /// Transport calls allowed to run at once, timed-out ones included.
    pub max_in_flight: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            default_topic: "sales-orders".to_string(),
            topic_overrides: HashMap::new(),
            success_topic: None,
            failure_topic: None,
            publish_timeout: Duration::from_secs(3),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl PublisherConfig {
    pub fn with_topic_override(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.topic_overrides.insert(event_type.into(), topic.into());
        self
    }

    pub fn topic_for(&self, event_type: &str) -> &str {
        self.topic_overrides
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(&self.default_topic)
    }
}

/// Result of one transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Failed(TransportError),
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered)
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// The event could not be turned into an envelope; the raising
    /// transaction must not commit.
    #[error("failed to serialize {event_type} event: {source}")]
    Serialization {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A stored failure payload is not a valid envelope.
    #[error("failure record {record_id} holds an undecodable envelope: {source}")]
    Undecodable {
        record_id: stockflow_core::FailureRecordId,
        #[source]
        source: serde_json::Error,
    },

    #[error("failure tracking error: {0}")]
    Tracker(#[from] FailureStoreError),
}

/// What happened to one committed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: Uuid,
    pub outcome: PublishOutcome,
    /// Failure record created for a failed attempt.
    pub failure: Option<FailureRecord>,
}

/// Raises events into transactions and publishes them once committed.
///
/// Cheap to clone; clones share the transport, tracker and config.
#[derive(Clone)]
pub struct EventPublisher {
    transport: TimeoutTransport,
    tracker: FailureTracker,
    config: Arc<PublisherConfig>,
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn Transport>, tracker: FailureTracker, config: PublisherConfig) -> Self {
        Self {
            transport: TimeoutTransport::new(transport, config.publish_timeout)
                .with_max_in_flight(config.max_in_flight),
            tracker,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    /// Wrap `event` in an envelope and queue it on `tx`.
    ///
    /// Nothing is sent now. A serialization failure is returned so the caller
    /// aborts the transaction instead of committing an event it cannot emit.
    pub fn raise<E>(&self, tx: &mut Transaction, event: E) -> Result<Uuid, PublishError>
    where
        E: Event + Serialize,
    {
        let event_type = event.event_type();
        let envelope = EventEnvelope::wrap(event, tx.context());
        let payload = envelope
            .encode()
            .map_err(|source| PublishError::Serialization { event_type, source })?;

        let event_id = envelope.event_id();
        tx.enqueue(PendingEvent {
            event_id,
            event_type: event_type.to_string(),
            topic: self.config.topic_for(event_type).to_string(),
            payload,
        });

        debug!(
            transaction_id = %tx.id(),
            event_id = %event_id,
            event_type,
            "event raised; waiting for commit"
        );
        Ok(event_id)
    }

    /// One bounded transport call. No retries.
    pub fn attempt_publish(&self, topic: &str, payload: &[u8]) -> PublishOutcome {
        match self.transport.publish(topic, payload) {
            Ok(()) => PublishOutcome::Delivered,
            Err(e) => PublishOutcome::Failed(e),
        }
    }

    /// Publish events released by a committed transaction.
    ///
    /// Every failure is durably recorded before this returns.
    pub fn publish_committed(&self, events: Vec<PendingEvent>) -> Vec<PublishReport> {
        events
            .into_iter()
            .map(|event| self.publish_one(event))
            .collect()
    }

    fn publish_one(&self, event: PendingEvent) -> PublishReport {
        let outcome = self.attempt_publish(&event.topic, &event.payload);

        let failure = match &outcome {
            PublishOutcome::Delivered => {
                debug!(event_id = %event.event_id, topic = %event.topic, "event published");
                self.notify(self.config.success_topic.as_deref(), &event, "published", None);
                None
            }
            PublishOutcome::Failed(err) => {
                // Recorded before the notice, which may block for a full timeout.
                let failure = self.track(&event, err);
                self.notify(
                    self.config.failure_topic.as_deref(),
                    &event,
                    "failed",
                    Some(err),
                );
                failure
            }
        };

        PublishReport {
            event_id: event.event_id,
            outcome,
            failure,
        }
    }

    fn track(&self, event: &PendingEvent, err: &TransportError) -> Option<FailureRecord> {
        let failure = NewFailure {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            topic: event.topic.clone(),
            payload: event.payload.clone(),
            error_message: err.to_string(),
        };

        match self.tracker.record(failure) {
            Ok(record) => Some(record),
            Err(tracking_err) => {
                // Neither delivered nor recorded: the only trace left is this log line.
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    topic = %event.topic,
                    publish_error = %err,
                    error = %tracking_err,
                    payload = %String::from_utf8_lossy(&event.payload),
                    "failed to record publication failure"
                );
                None
            }
        }
    }

    /// Re-send a recorded failure's stored envelope to its stored topic.
    ///
    /// Does not touch the failure record; the caller owns its bookkeeping.
    pub fn replay(&self, record: &FailureRecord) -> Result<PublishOutcome, PublishError> {
        EventEnvelope::<JsonValue>::decode_untyped(&record.payload).map_err(|source| {
            PublishError::Undecodable {
                record_id: record.id,
                source,
            }
        })?;

        let outcome = self.attempt_publish(&record.topic, &record.payload);
        if outcome.is_delivered() {
            let event = PendingEvent {
                event_id: record.event_id,
                event_type: record.event_type.clone(),
                topic: record.topic.clone(),
                payload: Vec::new(),
            };
            self.notify(self.config.success_topic.as_deref(), &event, "republished", None);
        }
        Ok(outcome)
    }

    /// Best-effort notice; its own failure is only logged.
    fn notify(
        &self,
        topic: Option<&str>,
        event: &PendingEvent,
        status: &str,
        err: Option<&TransportError>,
    ) {
        let Some(topic) = topic else {
            return;
        };

        let notice = json!({
            "event_id": event.event_id,
            "event_type": event.event_type,
            "topic": event.topic,
            "status": status,
            "error": err.map(|e| e.to_string()),
        });
        let payload = match serde_json::to_vec(&notice) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "failed to encode publication notice");
                return;
            }
        };

        if let PublishOutcome::Failed(e) = self.attempt_publish(topic, &payload) {
            warn!(
                event_id = %event.event_id,
                notice_topic = topic,
                error = %e,
                "publication notice not delivered"
            );
        }
    }
}

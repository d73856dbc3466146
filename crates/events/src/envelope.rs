use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use stockflow_core::RequestContext;

use crate::Event;

/// Envelope for an event, carrying identity and request metadata.
///
/// This is the unit that is serialized onto the transport and, when delivery
/// fails, stored verbatim in a failure record for later replay.
///
/// Notes:
/// - `event_id` is unique per raised event and is what makes failure records
///   idempotent (one record per event).
/// - `correlation_id` and `actor` come from the explicit request context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    event_type: String,
    event_version: u32,
    aggregate_id: Uuid,
    occurred_at: DateTime<Utc>,
    correlation_id: Uuid,
    actor: String,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap a typed event with a fresh event id and the request metadata.
    pub fn wrap(event: E, context: &RequestContext) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            aggregate_id: event.aggregate_id(),
            occurred_at: event.occurred_at(),
            correlation_id: context.correlation_id(),
            actor: context.actor().username().to_string(),
            payload: event,
        }
    }
}

impl<E: Serialize> EventEnvelope<E> {
    /// Serialize the envelope into the wire representation (JSON bytes).
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<E: DeserializeOwned> EventEnvelope<E> {
    /// Parse the wire representation produced by [`EventEnvelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl EventEnvelope<JsonValue> {
    /// Parse only the envelope, leaving the payload untyped.
    pub fn decode_untyped(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{Actor, ActorKind, UserId};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pinged {
        target: Uuid,
        at: DateTime<Utc>,
    }

    impl Event for Pinged {
        fn event_type(&self) -> &'static str {
            "test.pinged"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }

        fn aggregate_id(&self) -> Uuid {
            self.target
        }
    }

    #[test]
    fn wrap_copies_event_metadata_and_context() {
        let ctx = RequestContext::new(Actor::new(UserId::new(), "alice", ActorKind::User));
        let event = Pinged {
            target: Uuid::now_v7(),
            at: Utc::now(),
        };

        let env = EventEnvelope::wrap(event.clone(), &ctx);

        assert_eq!(env.event_type(), "test.pinged");
        assert_eq!(env.event_version(), 2);
        assert_eq!(env.aggregate_id(), event.target);
        assert_eq!(env.correlation_id(), ctx.correlation_id());
        assert_eq!(env.actor(), "alice");
        assert_eq!(env.payload(), &event);
    }

    #[test]
    fn untyped_decode_keeps_payload_fields() {
        let ctx = RequestContext::system();
        let env = EventEnvelope::wrap(
            Pinged {
                target: Uuid::now_v7(),
                at: Utc::now(),
            },
            &ctx,
        );
        let bytes = env.encode().unwrap();

        let untyped = EventEnvelope::decode_untyped(&bytes).unwrap();
        assert_eq!(untyped.event_id(), env.event_id());
        assert!(untyped.payload().get("target").is_some());
    }

    #[test]
    fn decode_rejects_non_envelope_bytes() {
        assert!(EventEnvelope::decode_untyped(b"{\"nope\":1}").is_err());
    }
}

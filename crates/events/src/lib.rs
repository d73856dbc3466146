//! Domain events, envelopes and the outbound message transport contract.

pub mod envelope;
pub mod event;
pub mod in_memory_transport;
pub mod transport;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_transport::{InMemoryTransport, PublishedMessage};
pub use transport::{DEFAULT_MAX_IN_FLIGHT, Subscription, TimeoutTransport, Transport, TransportError};

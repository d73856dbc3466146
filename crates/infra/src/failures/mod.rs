//! Durable tracking of failed event publications.
//!
//! Every post-commit publish that the transport refuses becomes a
//! [`FailureRecord`] holding the exact serialized envelope, so the retry
//! scheduler can replay it byte-for-byte later. Records are never deleted
//! automatically; they end either retried or exhausted.

pub mod postgres;
pub mod store;
pub mod tracker;
pub mod types;

pub use postgres::PostgresFailureStore;
pub use store::{FailureStore, FailureStoreError, InMemoryFailureStore};
pub use tracker::FailureTracker;
pub use types::{FailureRecord, FailureState, FailureStats, NewFailure};

//! `stockflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod context;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use context::{Actor, ActorKind, RequestContext};
pub use error::{DomainError, DomainResult};
pub use id::{CustomerId, FailureRecordId, OrderId, ProductId, StockId, UserId};

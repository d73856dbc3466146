//! Durable storage for inventory rows.
//!
//! The ledger store offers exactly the primitives the locking strategies need:
//! a plain read, a version-conditioned write (optimistic) and an exclusive
//! row lock that is released when its guard goes away (pessimistic).

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use r#trait::{LedgerStore, LedgerStoreError, StockLock};

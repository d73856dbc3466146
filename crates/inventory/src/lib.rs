//! Inventory domain module.
//!
//! This crate contains the stock row and its business rules, implemented purely
//! as deterministic domain logic (no IO, no locking, no storage).

pub mod stock;

pub use stock::{StockChange, StockError, StockRecord};

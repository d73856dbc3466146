//! Sales domain module: purchase orders and the events they raise.
//!
//! Pure domain logic; persistence and transactions live in `stockflow-infra`.

pub mod order;

pub use order::{Order, OrderEvent, OrderPlaced, OrderStatus};

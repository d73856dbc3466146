//! Infrastructure layer: stock ledger, transactions, event publication,
//! failure tracking and retry, configuration.

pub mod backoff;
pub mod config;
pub mod failures;
pub mod ledger_store;
pub mod order_service;
pub mod order_store;
pub mod publisher;
pub mod scheduler;
pub mod stock_ledger;
pub mod transaction;
pub mod transport;


pub use backoff::{BackoffStrategy, RetryPolicy};
pub use config::{ConfigError, StockflowConfig};
pub use failures::{
    FailureRecord, FailureState, FailureStats, FailureStore, FailureStoreError, FailureTracker,
    InMemoryFailureStore, NewFailure, PostgresFailureStore,
};
pub use ledger_store::{InMemoryLedgerStore, LedgerStore, LedgerStoreError, PostgresLedgerStore, StockLock};
pub use order_service::{OrderFailure, OrderService, PlaceOrderError, PlacedOrder};
pub use order_store::{InMemoryOrderStore, OrderStore, OrderStoreError};
pub use publisher::{EventPublisher, PublishError, PublishOutcome, PublishReport, PublisherConfig};
pub use scheduler::{
    RetryScheduler, RetrySchedulerConfig, RetrySchedulerHandle, SchedulerStats, SweepOutcome, SweepReport,
};
pub use stock_ledger::{
    LedgerConfig, LedgerError, LockingMode, LockingStrategy, OptimisticLocking, PessimisticLocking, StockLedger,
};
pub use transaction::{PendingEvent, RollbackError, Transaction, TransactionState, UnitOfWork};

//! Stock ledger: applies stock mutations under a configurable locking discipline.
//!
//! Two strategies are provided and selected through [`LedgerConfig`]:
//!
//! - [`OptimisticLocking`]: version-checked compare-and-swap with bounded,
//!   jittered retries.
//! - [`PessimisticLocking`]: exclusive row lock held for the read-compute-write.
//!
//! Either way, for one product no two mutations are computed from the same
//! pre-mutation quantity, and the quantity never goes below zero. The ledger
//! never publishes events; callers that need to raise one do so through the
//! enclosing [`Transaction`].

pub mod optimistic;
pub mod pessimistic;

pub use optimistic::OptimisticLocking;
pub use pessimistic::PessimisticLocking;

use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use stockflow_core::ProductId;
use stockflow_inventory::{StockChange, StockError, StockRecord};

use crate::backoff::RetryPolicy;
use crate::ledger_store::{LedgerStore, LedgerStoreError};
use crate::transaction::Transaction;

/// Which concurrency discipline the ledger uses for decrements and increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    #[default]
    Optimistic,
    Pessimistic,
}

impl LockingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockingMode::Optimistic => "optimistic",
            LockingMode::Pessimistic => "pessimistic",
        }
    }
}

impl FromStr for LockingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Ok(LockingMode::Optimistic),
            "pessimistic" => Ok(LockingMode::Pessimistic),
            other => Err(format!(
                "unknown locking mode '{other}' (expected 'optimistic' or 'pessimistic')"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub mode: LockingMode,
    /// Attempt budget and backoff for the optimistic strategy.
    pub retry: RetryPolicy,
    /// Longest wait for an exclusive row lock.
    pub lock_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mode: LockingMode::Optimistic,
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Business rule violation (invalid amount, insufficient stock, overflow).
    #[error(transparent)]
    Stock(#[from] StockError),

    /// Contention outlasted the retry budget or the lock wait. Transient.
    #[error("gave up on product {product_id} after {attempts} contended attempt(s)")]
    ConcurrencyExhausted { product_id: ProductId, attempts: u32 },

    #[error("product {0} has no stock row")]
    ProductNotFound(ProductId),

    #[error("product {0} already has a stock row")]
    AlreadyRegistered(ProductId),

    #[error("ledger store error: {0}")]
    Store(LedgerStoreError),
}

impl LedgerError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrencyExhausted { .. } | LedgerError::Store(_)
        )
    }
}

impl From<LedgerStoreError> for LedgerError {
    fn from(err: LedgerStoreError) -> Self {
        match err {
            LedgerStoreError::NotFound(product_id) => LedgerError::ProductNotFound(product_id),
            LedgerStoreError::AlreadyExists(product_id) => LedgerError::AlreadyRegistered(product_id),
            LedgerStoreError::LockTimeout { product_id, .. } => LedgerError::ConcurrencyExhausted {
                product_id,
                attempts: 1,
            },
            other => LedgerError::Store(other),
        }
    }
}

/// New quantity computed from the current row, or the rule it would break.
pub type Mutation<'a> = &'a (dyn Fn(&StockRecord) -> Result<u64, StockError> + Sync);

/// A concurrency discipline for read-compute-write on one stock row.
pub trait LockingStrategy: Send + Sync + core::fmt::Debug {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        store: &dyn LedgerStore,
        product_id: ProductId,
        mutation: Mutation<'_>,
    ) -> Result<StockChange, LedgerError>;
}

/// Attempt budget for compensating increments: lock waits and store errors
/// are retried well past what a regular mutation would tolerate.
fn default_restore_retry() -> RetryPolicy {
    RetryPolicy::exponential(50, Duration::from_millis(10), Duration::from_secs(1))
}

/// Entry point for every stock mutation.
///
/// Cheap to clone; clones share the store and strategy.
#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn LedgerStore>,
    strategy: Arc<dyn LockingStrategy>,
    exclusive: PessimisticLocking,
    restore_retry: RetryPolicy,
}

impl core::fmt::Debug for StockLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StockLedger")
            .field("strategy", &self.strategy)
            .field("exclusive", &self.exclusive)
            .field("restore_retry", &self.restore_retry)
            .finish_non_exhaustive()
    }
}

impl StockLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> Self {
        let strategy: Arc<dyn LockingStrategy> = match config.mode {
            LockingMode::Optimistic => Arc::new(OptimisticLocking::new(config.retry.clone())),
            LockingMode::Pessimistic => Arc::new(PessimisticLocking::new(config.lock_timeout)),
        };
        Self::with_strategy(store, strategy, config.lock_timeout)
    }

    pub fn with_strategy(
        store: Arc<dyn LedgerStore>,
        strategy: Arc<dyn LockingStrategy>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            strategy,
            exclusive: PessimisticLocking::new(lock_timeout),
            restore_retry: default_restore_retry(),
        }
    }

    /// Override how long [`restore`](Self::restore) keeps retrying transient
    /// failures.
    pub fn with_restore_retry(mut self, policy: RetryPolicy) -> Self {
        self.restore_retry = policy;
        self
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Create the stock row for a product.
    pub fn register(&self, product_id: ProductId, initial_quantity: u64) -> Result<StockRecord, LedgerError> {
        let record = StockRecord::new(product_id, initial_quantity);
        self.store.insert(record.clone())?;
        info!(product_id = %product_id, quantity = initial_quantity, "stock row registered");
        Ok(record)
    }

    /// Current row for a product.
    pub fn available(&self, product_id: ProductId) -> Result<StockRecord, LedgerError> {
        self.store
            .get(product_id)?
            .ok_or(LedgerError::ProductNotFound(product_id))
    }

    /// Remove `amount` units. Fails without touching the row when that would
    /// take the quantity below zero.
    pub fn decrement(&self, product_id: ProductId, amount: u64) -> Result<StockChange, LedgerError> {
        if amount == 0 {
            return Err(StockError::InvalidAmount.into());
        }

        let result = self.strategy.apply(self.store.as_ref(), product_id, &|record: &StockRecord| {
            record.quantity_after_decrease(amount)
        });
        self.log_outcome("decrement", product_id, amount, &result);
        result
    }

    /// Add `amount` units through the configured strategy.
    pub fn increment(&self, product_id: ProductId, amount: u64) -> Result<StockChange, LedgerError> {
        if amount == 0 {
            return Err(StockError::InvalidAmount.into());
        }

        let result = self.strategy.apply(self.store.as_ref(), product_id, &|record: &StockRecord| {
            record.quantity_after_increase(amount)
        });
        self.log_outcome("increment", product_id, amount, &result);
        result
    }

    /// Compensating increment. Always takes the exclusive row lock, so it
    /// cannot lose a retry race against ongoing decrements.
    ///
    /// Lock timeouts and store errors are retried under the restore policy;
    /// only a rule violation or an exhausted budget is returned.
    pub fn restore(&self, product_id: ProductId, amount: u64) -> Result<StockChange, LedgerError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = self.exclusive.apply(self.store.as_ref(), product_id, &|record: &StockRecord| {
                record.quantity_after_increase(amount)
            });

            match result {
                Err(e) if e.is_transient() && self.restore_retry.should_retry(attempt) => {
                    warn!(
                        product_id = %product_id,
                        amount,
                        attempt,
                        error = %e,
                        "restore blocked, retrying"
                    );
                    thread::sleep(self.restore_retry.delay_for_attempt(attempt));
                }
                result => {
                    self.log_outcome("restore", product_id, amount, &result);
                    return result;
                }
            }
        }
    }

    /// Decrement as part of `tx`; rolling `tx` back restores the units.
    pub fn decrement_in(
        &self,
        tx: &mut Transaction,
        product_id: ProductId,
        amount: u64,
    ) -> Result<StockChange, LedgerError> {
        let change = self.decrement(product_id, amount)?;

        let ledger = self.clone();
        tx.on_rollback(format!("restore {amount} unit(s) of product {product_id}"), move || {
            ledger.restore(product_id, amount)?;
            Ok(())
        });

        Ok(change)
    }

    fn log_outcome(
        &self,
        operation: &'static str,
        product_id: ProductId,
        amount: u64,
        result: &Result<StockChange, LedgerError>,
    ) {
        match result {
            Ok(change) => debug!(
                operation,
                strategy = self.strategy.name(),
                product_id = %product_id,
                amount,
                quantity = change.quantity,
                version = change.version,
                attempts = change.attempts,
                "stock mutation applied"
            ),
            Err(LedgerError::ConcurrencyExhausted { attempts, .. }) => warn!(
                operation,
                strategy = self.strategy.name(),
                product_id = %product_id,
                amount,
                attempts = *attempts,
                "stock mutation gave up under contention"
            ),
            Err(e) => debug!(
                operation,
                strategy = self.strategy.name(),
                product_id = %product_id,
                amount,
                error = %e,
                "stock mutation rejected"
            ),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use stockflow_core::{ExpectedVersion, ProductId};
use stockflow_inventory::StockRecord;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerStoreError {
    #[error("no stock row for product {0}")]
    NotFound(ProductId),

    #[error("stock row for product {0} already exists")]
    AlreadyExists(ProductId),

    #[error("timed out after {waited:?} waiting for the lock on product {product_id}")]
    LockTimeout {
        product_id: ProductId,
        waited: Duration,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Exclusive hold on one stock row.
///
/// Obtained from [`LedgerStore::lock_and_read`]. Until the guard is written or
/// dropped, no other writer (locking or compare-and-swap) can change the row.
/// Dropping the guard without writing releases the lock and leaves the row as
/// it was.
pub trait StockLock: Send {
    /// The row as read under the lock.
    fn record(&self) -> &StockRecord;

    /// Persist `quantity` (bumping the version) and release the lock.
    fn write(self: Box<Self>, quantity: u64) -> Result<StockRecord, LedgerStoreError>;
}

/// Storage boundary for stock rows.
///
/// ## Thread Safety
///
/// Implementations are shared by every thread placing orders; all methods
/// take `&self`.
pub trait LedgerStore: Send + Sync {
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerStoreError>;

    /// Insert a new row. Fails with `AlreadyExists` when the product has one.
    fn insert(&self, record: StockRecord) -> Result<(), LedgerStoreError>;

    /// Write `quantity` only if the row is still at `expected`.
    ///
    /// Returns the updated row, or `None` when the version moved (or the row is
    /// currently held by a lock). A missing row is `NotFound`.
    fn compare_and_swap(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        quantity: u64,
    ) -> Result<Option<StockRecord>, LedgerStoreError>;

    /// Take the exclusive row lock, waiting at most `wait`, and read the row.
    fn lock_and_read(
        &self,
        product_id: ProductId,
        wait: Duration,
    ) -> Result<Box<dyn StockLock>, LedgerStoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerStoreError> {
        (**self).get(product_id)
    }

    fn insert(&self, record: StockRecord) -> Result<(), LedgerStoreError> {
        (**self).insert(record)
    }

    fn compare_and_swap(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        quantity: u64,
    ) -> Result<Option<StockRecord>, LedgerStoreError> {
        (**self).compare_and_swap(product_id, expected, quantity)
    }

    fn lock_and_read(
        &self,
        product_id: ProductId,
        wait: Duration,
    ) -> Result<Box<dyn StockLock>, LedgerStoreError> {
        (**self).lock_and_read(product_id, wait)
    }
}

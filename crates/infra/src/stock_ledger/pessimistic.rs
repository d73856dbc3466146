use std::time::Duration;

use stockflow_core::ProductId;
use stockflow_inventory::StockChange;

use super::{LedgerError, LockingStrategy, Mutation};
use crate::ledger_store::LedgerStore;

/// Exclusive row lock for the whole read-compute-write.
///
/// The lock guard is released on every exit path: `write` releases it after
/// persisting, and an early return (rule violation, store error) drops it.
#[derive(Debug, Clone)]
pub struct PessimisticLocking {
    lock_timeout: Duration,
}

impl PessimisticLocking {
    pub fn new(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

impl Default for PessimisticLocking {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl LockingStrategy for PessimisticLocking {
    fn name(&self) -> &'static str {
        "pessimistic"
    }

    fn apply(
        &self,
        store: &dyn LedgerStore,
        product_id: ProductId,
        mutation: Mutation<'_>,
    ) -> Result<StockChange, LedgerError> {
        let guard = store.lock_and_read(product_id, self.lock_timeout)?;
        let before = guard.record().clone();
        let quantity = mutation(&before)?;
        let after = guard.write(quantity)?;

        Ok(StockChange::between(&before, &after, 1))
    }
}

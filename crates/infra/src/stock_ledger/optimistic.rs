use std::thread;

use tracing::debug;

use stockflow_core::{AggregateRoot, ExpectedVersion, ProductId};
use stockflow_inventory::StockChange;

use super::{LedgerError, LockingStrategy, Mutation};
use crate::backoff::RetryPolicy;
use crate::ledger_store::LedgerStore;

/// Read, compute, compare-and-swap on version; re-read and retry on conflict.
///
/// Never holds a lock across attempts. Between attempts it sleeps for a
/// jittered backoff from `policy`; once `policy.max_attempts` swaps have lost
/// the race the request fails with `ConcurrencyExhausted`.
#[derive(Debug, Clone)]
pub struct OptimisticLocking {
    policy: RetryPolicy,
}

impl OptimisticLocking {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Default for OptimisticLocking {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl LockingStrategy for OptimisticLocking {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    fn apply(
        &self,
        store: &dyn LedgerStore,
        product_id: ProductId,
        mutation: Mutation<'_>,
    ) -> Result<StockChange, LedgerError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let before = store
                .get(product_id)?
                .ok_or(LedgerError::ProductNotFound(product_id))?;
            let quantity = mutation(&before)?;

            let swapped = store.compare_and_swap(
                product_id,
                ExpectedVersion::Exact(before.version()),
                quantity,
            )?;

            if let Some(after) = swapped {
                return Ok(StockChange::between(&before, &after, attempt));
            }

            debug!(
                product_id = %product_id,
                attempt,
                seen_version = before.version(),
                "version conflict on stock row"
            );

            if !self.policy.should_retry(attempt) {
                return Err(LedgerError::ConcurrencyExhausted {
                    product_id,
                    attempts: attempt,
                });
            }

            thread::sleep(self.policy.delay_for_attempt(attempt));
        }
    }
}

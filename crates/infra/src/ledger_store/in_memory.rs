use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

use stockflow_core::{AggregateRoot, ExpectedVersion, ProductId};
use stockflow_inventory::StockRecord;

use super::r#trait::{LedgerStore, LedgerStoreError, StockLock};

#[derive(Debug)]
struct RowState {
    record: StockRecord,
    locked: bool,
}

/// One stock row plus its exclusive-lock flag.
///
/// The mutex only protects short critical sections; the row-level lock handed
/// out by `lock_and_read` is the `locked` flag, waited on through `released`.
#[derive(Debug)]
struct StockRow {
    state: Mutex<RowState>,
    released: Condvar,
}

impl StockRow {
    fn new(record: StockRecord) -> Self {
        Self {
            state: Mutex::new(RowState {
                record,
                locked: false,
            }),
            released: Condvar::new(),
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> LedgerStoreError {
    LedgerStoreError::Storage("in-memory ledger lock poisoned".to_string())
}

/// In-memory ledger store for tests/dev.
///
/// - Per-row locking, so different products never contend
/// - Compare-and-swap is refused while a row is exclusively locked
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    rows: RwLock<HashMap<ProductId, Arc<StockRow>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn row(&self, product_id: ProductId) -> Result<Arc<StockRow>, LedgerStoreError> {
        let rows = self.rows.read().map_err(poisoned)?;
        rows.get(&product_id)
            .cloned()
            .ok_or(LedgerStoreError::NotFound(product_id))
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerStoreError> {
        let row = match self.row(product_id) {
            Ok(row) => row,
            Err(LedgerStoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let state = row.state.lock().map_err(poisoned)?;
        Ok(Some(state.record.clone()))
    }

    fn insert(&self, record: StockRecord) -> Result<(), LedgerStoreError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        match rows.entry(record.product_id()) {
            Entry::Occupied(_) => Err(LedgerStoreError::AlreadyExists(record.product_id())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(StockRow::new(record)));
                Ok(())
            }
        }
    }

    fn compare_and_swap(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        quantity: u64,
    ) -> Result<Option<StockRecord>, LedgerStoreError> {
        let row = self.row(product_id)?;
        let mut state = row.state.lock().map_err(poisoned)?;

        if state.locked || !expected.matches(state.record.version()) {
            return Ok(None);
        }

        state.record = state.record.with_quantity(quantity);
        Ok(Some(state.record.clone()))
    }

    fn lock_and_read(
        &self,
        product_id: ProductId,
        wait: Duration,
    ) -> Result<Box<dyn StockLock>, LedgerStoreError> {
        let row = self.row(product_id)?;

        let record = {
            let state = row.state.lock().map_err(poisoned)?;
            let (mut state, _) = row
                .released
                .wait_timeout_while(state, wait, |s| s.locked)
                .map_err(poisoned)?;

            if state.locked {
                return Err(LedgerStoreError::LockTimeout {
                    product_id,
                    waited: wait,
                });
            }

            state.locked = true;
            state.record.clone()
        };

        Ok(Box::new(InMemoryStockLock {
            row,
            record,
            held: true,
        }))
    }
}

#[derive(Debug)]
struct InMemoryStockLock {
    row: Arc<StockRow>,
    record: StockRecord,
    held: bool,
}

impl InMemoryStockLock {
    fn release(&mut self, state: &mut RowState) {
        state.locked = false;
        self.held = false;
    }
}

impl StockLock for InMemoryStockLock {
    fn record(&self) -> &StockRecord {
        &self.record
    }

    fn write(mut self: Box<Self>, quantity: u64) -> Result<StockRecord, LedgerStoreError> {
        let row = Arc::clone(&self.row);
        let written = {
            let mut state = row.state.lock().map_err(poisoned)?;

            if state.record.version() != self.record.version() {
                return Err(LedgerStoreError::Storage(format!(
                    "stock row for product {} changed while exclusively locked",
                    self.record.product_id()
                )));
            }

            state.record = state.record.with_quantity(quantity);
            self.release(&mut state);
            state.record.clone()
        };
        row.released.notify_all();

        Ok(written)
    }
}

impl Drop for InMemoryStockLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        let row = Arc::clone(&self.row);
        {
            let mut state = row.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.release(&mut state);
        }
        row.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn seeded(quantity: u64) -> (InMemoryLedgerStore, ProductId) {
        let store = InMemoryLedgerStore::new();
        let product_id = ProductId::new();
        store.insert(StockRecord::new(product_id, quantity)).unwrap();
        (store, product_id)
    }

    #[test]
    fn insert_then_get() {
        let (store, product_id) = seeded(10);
        let record = store.get(product_id).unwrap().unwrap();
        assert_eq!(record.quantity(), 10);
        assert_eq!(record.version(), 0);

        assert!(store.get(ProductId::new()).unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (store, product_id) = seeded(10);
        let err = store.insert(StockRecord::new(product_id, 3)).unwrap_err();
        assert_eq!(err, LedgerStoreError::AlreadyExists(product_id));
        assert_eq!(store.get(product_id).unwrap().unwrap().quantity(), 10);
    }

    #[test]
    fn compare_and_swap_checks_version() {
        let (store, product_id) = seeded(10);

        let updated = store
            .compare_and_swap(product_id, ExpectedVersion::Exact(0), 7)
            .unwrap()
            .unwrap();
        assert_eq!(updated.quantity(), 7);
        assert_eq!(updated.version(), 1);

        let stale = store
            .compare_and_swap(product_id, ExpectedVersion::Exact(0), 1)
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(store.get(product_id).unwrap().unwrap().quantity(), 7);
    }

    #[test]
    fn compare_and_swap_on_missing_row_is_not_found() {
        let store = InMemoryLedgerStore::new();
        let product_id = ProductId::new();
        let err = store
            .compare_and_swap(product_id, ExpectedVersion::Any, 1)
            .unwrap_err();
        assert_eq!(err, LedgerStoreError::NotFound(product_id));
    }

    #[test]
    fn locked_row_refuses_compare_and_swap() {
        let (store, product_id) = seeded(10);
        let guard = store.lock_and_read(product_id, Duration::from_millis(50)).unwrap();

        let refused = store
            .compare_and_swap(product_id, ExpectedVersion::Exact(0), 1)
            .unwrap();
        assert!(refused.is_none());

        let written = guard.write(4).unwrap();
        assert_eq!(written.quantity(), 4);
        assert_eq!(written.version(), 1);
        assert_eq!(store.get(product_id).unwrap().unwrap().quantity(), 4);
    }

    #[test]
    fn dropping_guard_releases_without_writing() {
        let (store, product_id) = seeded(10);
        {
            let guard = store.lock_and_read(product_id, Duration::from_millis(50)).unwrap();
            assert_eq!(guard.record().quantity(), 10);
        }

        let again = store.lock_and_read(product_id, Duration::from_millis(50)).unwrap();
        assert_eq!(again.record().version(), 0);
    }

    #[test]
    fn lock_wait_is_bounded() {
        let (store, product_id) = seeded(10);
        let _held = store.lock_and_read(product_id, Duration::from_millis(50)).unwrap();

        let started = Instant::now();
        let err = store
            .lock_and_read(product_id, Duration::from_millis(30))
            .err()
            .unwrap();
        assert!(matches!(err, LedgerStoreError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn waiter_acquires_after_release() {
        let store = InMemoryLedgerStore::arc();
        let product_id = ProductId::new();
        store.insert(StockRecord::new(product_id, 10)).unwrap();

        let guard = store.lock_and_read(product_id, Duration::from_millis(50)).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let guard = store.lock_and_read(product_id, Duration::from_secs(5)).unwrap();
                let qty = guard.record().quantity() - 1;
                guard.write(qty).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(20));
        guard.write(9).unwrap();

        let after = waiter.join().unwrap();
        assert_eq!(after.quantity(), 8);
        assert_eq!(after.version(), 2);
    }
}

//! Postgres-backed ledger store.
//!
//! ## Concurrency
//!
//! - **Optimistic**: `compare_and_swap` is a single `UPDATE ... WHERE version = $n`;
//!   zero affected rows means another writer got there first.
//! - **Pessimistic**: `lock_and_read` opens a transaction and takes the row with
//!   `SELECT ... FOR UPDATE`, bounded by a transaction-local `lock_timeout`. The
//!   returned guard owns that transaction; `write` commits it, dropping the guard
//!   rolls it back (sqlx rolls back unfinished transactions on drop), which
//!   releases the row lock either way.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | LedgerStoreError |
//! |-----------------------|------------------|
//! | `23505` unique violation | `AlreadyExists` |
//! | `55P03` lock not available | `LockTimeout` |
//! | anything else | `Storage` |
//!
//! The synchronous [`LedgerStore`] impl bridges into the async queries with
//! `tokio::runtime::Handle::block_on`, so it must be called from a thread that
//! can see a tokio runtime but is not itself driving async tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use stockflow_core::{AggregateRoot, ExpectedVersion, ProductId, StockId};
use stockflow_inventory::StockRecord;

use super::r#trait::{LedgerStore, LedgerStoreError, StockLock};

/// DDL for the `stock` table.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stock (
    id          UUID PRIMARY KEY,
    product_id  UUID NOT NULL UNIQUE,
    quantity    BIGINT NOT NULL CHECK (quantity >= 0),
    version     BIGINT NOT NULL DEFAULT 0,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const STOCK_COLUMNS: &str = "id, product_id, quantity, version, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `stock` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), LedgerStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn fetch(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerStoreError> {
        let row = sqlx::query(&format!("SELECT {STOCK_COLUMNS} FROM stock WHERE product_id = $1"))
            .bind(product_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(product_id = %record.product_id()), err)]
    pub async fn insert_record(&self, record: &StockRecord) -> Result<(), LedgerStoreError> {
        let result = sqlx::query(
            "INSERT INTO stock (id, product_id, quantity, version, updated_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.stock_id().as_uuid())
        .bind(record.product_id().as_uuid())
        .bind(to_db_quantity(record.quantity())?)
        .bind(record.version() as i64)
        .bind(record.updated_at())
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerStoreError::AlreadyExists(record.product_id()))
            }
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    #[instrument(skip(self), fields(product_id = %product_id, expected = ?expected), err)]
    pub async fn swap(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        quantity: u64,
    ) -> Result<Option<StockRecord>, LedgerStoreError> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let row = sqlx::query(&format!(
            "UPDATE stock SET quantity = $1, version = version + 1, updated_at = now() \
             WHERE product_id = $2 AND ($3::BIGINT IS NULL OR version = $3) \
             RETURNING {STOCK_COLUMNS}"
        ))
        .bind(to_db_quantity(quantity)?)
        .bind(product_id.as_uuid())
        .bind(expected_version)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        match row {
            Some(row) => record_from_row(&row).map(Some),
            // Distinguish "version moved" from "no such row".
            None if self.fetch(product_id).await?.is_some() => Ok(None),
            None => Err(LedgerStoreError::NotFound(product_id)),
        }
    }

    #[instrument(skip(self), fields(product_id = %product_id, wait_ms = wait.as_millis() as u64), err)]
    pub async fn lock_row(
        &self,
        product_id: ProductId,
        wait: Duration,
    ) -> Result<(Transaction<'static, Postgres>, StockRecord), LedgerStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", wait.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        let row = sqlx::query(&format!(
            "SELECT {STOCK_COLUMNS} FROM stock WHERE product_id = $1 FOR UPDATE"
        ))
        .bind(product_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if lock_not_available(&e) {
                LedgerStoreError::LockTimeout {
                    product_id,
                    waited: wait,
                }
            } else {
                map_sqlx_error("lock_and_read", e)
            }
        })?;

        let row = row.ok_or(LedgerStoreError::NotFound(product_id))?;
        let record = record_from_row(&row)?;
        Ok((tx, record))
    }
}

fn runtime() -> Result<Handle, LedgerStoreError> {
    Handle::try_current().map_err(|_| {
        LedgerStoreError::Storage(
            "PostgresLedgerStore requires a tokio runtime; call it from within a runtime context"
                .to_string(),
        )
    })
}

impl LedgerStore for PostgresLedgerStore {
    fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>, LedgerStoreError> {
        runtime()?.block_on(self.fetch(product_id))
    }

    fn insert(&self, record: StockRecord) -> Result<(), LedgerStoreError> {
        runtime()?.block_on(self.insert_record(&record))
    }

    fn compare_and_swap(
        &self,
        product_id: ProductId,
        expected: ExpectedVersion,
        quantity: u64,
    ) -> Result<Option<StockRecord>, LedgerStoreError> {
        runtime()?.block_on(self.swap(product_id, expected, quantity))
    }

    fn lock_and_read(
        &self,
        product_id: ProductId,
        wait: Duration,
    ) -> Result<Box<dyn StockLock>, LedgerStoreError> {
        let handle = runtime()?;
        let (tx, record) = handle.block_on(self.lock_row(product_id, wait))?;
        Ok(Box::new(PostgresStockLock {
            handle,
            tx: Some(tx),
            record,
        }))
    }
}

/// Row lock held by an open `SELECT ... FOR UPDATE` transaction.
struct PostgresStockLock {
    handle: Handle,
    tx: Option<Transaction<'static, Postgres>>,
    record: StockRecord,
}

impl StockLock for PostgresStockLock {
    fn record(&self) -> &StockRecord {
        &self.record
    }

    fn write(mut self: Box<Self>, quantity: u64) -> Result<StockRecord, LedgerStoreError> {
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| LedgerStoreError::Storage("row lock already released".to_string()))?;
        let product_id = self.record.product_id();
        let quantity = to_db_quantity(quantity)?;

        self.handle.block_on(async move {
            let row = sqlx::query(&format!(
                "UPDATE stock SET quantity = $1, version = version + 1, updated_at = now() \
                 WHERE product_id = $2 RETURNING {STOCK_COLUMNS}"
            ))
            .bind(quantity)
            .bind(product_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("locked_write", e))?;

            let record = record_from_row(&row)?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            Ok::<_, LedgerStoreError>(record)
        })
    }
}

fn to_db_quantity(quantity: u64) -> Result<i64, LedgerStoreError> {
    i64::try_from(quantity)
        .map_err(|_| LedgerStoreError::Storage(format!("quantity {quantity} exceeds BIGINT range")))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<StockRecord, LedgerStoreError> {
    let read = |e: sqlx::Error| LedgerStoreError::Storage(format!("failed to decode stock row: {e}"));

    let id: Uuid = row.try_get("id").map_err(read)?;
    let product_id: Uuid = row.try_get("product_id").map_err(read)?;
    let quantity: i64 = row.try_get("quantity").map_err(read)?;
    let version: i64 = row.try_get("version").map_err(read)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(read)?;

    let quantity = u64::try_from(quantity)
        .map_err(|_| LedgerStoreError::Storage(format!("negative quantity {quantity} in stock row")))?;

    Ok(StockRecord::from_parts(
        StockId::from_uuid(id),
        ProductId::from_uuid(product_id),
        quantity,
        version.max(0) as u64,
        updated_at,
    ))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            LedgerStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => LedgerStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

fn lock_not_available(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("55P03")
}

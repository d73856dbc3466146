//! Postgres-backed failure store.
//!
//! One row per failed event in `event_failures`, unique on `event_id`. The
//! payload column holds the serialized envelope bytes untouched so a replay
//! publishes exactly what the original attempt tried to publish.
//!
//! Like the ledger store, the synchronous [`FailureStore`] impl bridges into
//! the async queries with `tokio::runtime::Handle::block_on`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use stockflow_core::FailureRecordId;

use super::store::{FailureStore, FailureStoreError};
use super::types::{FailureRecord, FailureStats};

/// DDL for the `event_failures` table.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_failures (
    id               UUID PRIMARY KEY,
    event_id         UUID NOT NULL UNIQUE,
    event_type       TEXT NOT NULL,
    topic            TEXT NOT NULL,
    payload          BYTEA NOT NULL,
    error_message    TEXT NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    last_attempt_at  TIMESTAMPTZ,
    retried          BOOLEAN NOT NULL DEFAULT FALSE,
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    exhausted        BOOLEAN NOT NULL DEFAULT FALSE
)
"#;

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS event_failures_unretried ON event_failures (created_at, id) WHERE NOT retried",
    "CREATE INDEX IF NOT EXISTS event_failures_event_type ON event_failures (event_type)",
];

const FAILURE_COLUMNS: &str = "id, event_id, event_type, topic, payload, error_message, \
     created_at, updated_at, last_attempt_at, retried, attempt_count, exhausted";

#[derive(Debug, Clone)]
pub struct PostgresFailureStore {
    pool: Arc<PgPool>,
}

impl PostgresFailureStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and its indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), FailureStoreError> {
        for statement in std::iter::once(SCHEMA).chain(INDEXES.iter().copied()) {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| storage("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(failure_id = %record.id, event_id = %record.event_id), err)]
    pub async fn insert_record(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO event_failures ({FAILURE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(record.id.as_uuid())
        .bind(record.event_id)
        .bind(&record.event_type)
        .bind(&record.topic)
        .bind(&record.payload)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.last_attempt_at)
        .bind(record.retried)
        .bind(attempts_to_db(record.attempt_count))
        .bind(record.exhausted)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(FailureStoreError::Duplicate {
                    event_id: record.event_id,
                })
            }
            Err(e) => Err(storage("insert", e)),
        }
    }

    #[instrument(skip(self, record), fields(failure_id = %record.id), err)]
    pub async fn update_record(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        let result = sqlx::query(
            r"
            UPDATE event_failures
            SET error_message = $2,
                updated_at = $3,
                last_attempt_at = $4,
                retried = $5,
                attempt_count = $6,
                exhausted = $7
            WHERE id = $1 AND event_id = $8
            ",
        )
        .bind(record.id.as_uuid())
        .bind(&record.error_message)
        .bind(record.updated_at)
        .bind(record.last_attempt_at)
        .bind(record.retried)
        .bind(attempts_to_db(record.attempt_count))
        .bind(record.exhausted)
        .bind(record.event_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("update", e))?;

        if result.rows_affected() == 0 {
            return Err(FailureStoreError::NotFound(record.id));
        }
        Ok(())
    }

    /// Rows matching `filter` (a SQL predicate over `$1`/`$2`), oldest first.
    async fn select_where(
        &self,
        operation: &str,
        filter: &str,
        binds: Binds<'_>,
    ) -> Result<Vec<FailureRecord>, FailureStoreError> {
        let sql = format!(
            "SELECT {FAILURE_COLUMNS} FROM event_failures WHERE {filter} ORDER BY created_at ASC, id ASC"
        );
        let query = sqlx::query(&sql);
        let query = match binds {
            Binds::None => query,
            Binds::Id(id) => query.bind(id),
            Binds::Text(text) => query.bind(text),
            Binds::Range(from, to) => query.bind(from).bind(to),
        };

        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage(operation, e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn count_states(&self) -> Result<FailureStats, FailureStoreError> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE retried) AS retried,
                COUNT(*) FILTER (WHERE NOT retried AND exhausted) AS exhausted,
                COUNT(*) FILTER (WHERE NOT retried AND NOT exhausted) AS pending
            FROM event_failures
            ",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage("stats", e))?;

        let count = |column: &str| -> Result<usize, FailureStoreError> {
            let n: i64 = row
                .try_get(column)
                .map_err(|e| storage("stats", e))?;
            Ok(n.max(0) as usize)
        };

        Ok(FailureStats {
            total: count("total")?,
            pending: count("pending")?,
            retried: count("retried")?,
            exhausted: count("exhausted")?,
        })
    }
}

enum Binds<'a> {
    None,
    Id(Uuid),
    Text(&'a str),
    Range(DateTime<Utc>, DateTime<Utc>),
}

fn runtime() -> Result<Handle, FailureStoreError> {
    Handle::try_current().map_err(|_| {
        FailureStoreError::Storage(
            "PostgresFailureStore requires a tokio runtime; call it from within a runtime context"
                .to_string(),
        )
    })
}

fn first(records: Vec<FailureRecord>) -> Option<FailureRecord> {
    records.into_iter().next()
}

impl FailureStore for PostgresFailureStore {
    fn insert(&self, record: FailureRecord) -> Result<(), FailureStoreError> {
        runtime()?.block_on(self.insert_record(&record))
    }

    fn get(&self, id: FailureRecordId) -> Result<Option<FailureRecord>, FailureStoreError> {
        runtime()?
            .block_on(self.select_where("get", "id = $1", Binds::Id(*id.as_uuid())))
            .map(first)
    }

    fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<FailureRecord>, FailureStoreError> {
        runtime()?
            .block_on(self.select_where("find_by_event_id", "event_id = $1", Binds::Id(event_id)))
            .map(first)
    }

    fn update(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        runtime()?.block_on(self.update_record(record))
    }

    fn find_unretried(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        runtime()?.block_on(self.select_where("find_unretried", "NOT retried", Binds::None))
    }

    fn find_exhausted(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        runtime()?.block_on(self.select_where(
            "find_exhausted",
            "exhausted AND NOT retried",
            Binds::None,
        ))
    }

    fn find_by_event_type(&self, event_type: &str) -> Result<Vec<FailureRecord>, FailureStoreError> {
        runtime()?.block_on(self.select_where(
            "find_by_event_type",
            "event_type = $1",
            Binds::Text(event_type),
        ))
    }

    fn find_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FailureRecord>, FailureStoreError> {
        runtime()?.block_on(self.select_where(
            "find_created_between",
            "created_at BETWEEN $1 AND $2",
            Binds::Range(from, to),
        ))
    }

    fn stats(&self) -> Result<FailureStats, FailureStoreError> {
        runtime()?.block_on(self.count_states())
    }
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn storage(operation: &str, err: sqlx::Error) -> FailureStoreError {
    FailureStoreError::Storage(format!("sqlx error in {operation}: {err}"))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<FailureRecord, FailureStoreError> {
    let read = |e: sqlx::Error| storage("decode", e);

    let id: Uuid = row.try_get("id").map_err(read)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(read)?;

    Ok(FailureRecord {
        id: FailureRecordId::from_uuid(id),
        event_id: row.try_get("event_id").map_err(read)?,
        event_type: row.try_get("event_type").map_err(read)?,
        topic: row.try_get("topic").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
        error_message: row.try_get("error_message").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(read)?,
        retried: row.try_get("retried").map_err(read)?,
        attempt_count: attempt_count.max(0) as u32,
        exhausted: row.try_get("exhausted").map_err(read)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_count_saturates_into_integer_column() {
        assert_eq!(attempts_to_db(3), 3);
        assert_eq!(attempts_to_db(u32::MAX), i32::MAX);
    }

    #[test]
    fn schema_enforces_one_record_per_event() {
        assert!(SCHEMA.contains("event_id         UUID NOT NULL UNIQUE"));
        assert!(INDEXES.iter().any(|ddl| ddl.contains("WHERE NOT retried")));
    }

    #[test]
    fn sync_calls_without_runtime_fail_cleanly() {
        let err = runtime().unwrap_err();
        assert!(matches!(err, FailureStoreError::Storage(_)));
    }
}

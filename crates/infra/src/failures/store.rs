//! Failure record storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stockflow_core::FailureRecordId;

use super::types::{FailureRecord, FailureStats};

/// Failure record store abstraction.
///
/// `event_id` is unique: one event has at most one failure record.
/// Every `find_*` returns records oldest first (`created_at`, then `id`).
pub trait FailureStore: Send + Sync {
    /// Persist a new record.
    fn insert(&self, record: FailureRecord) -> Result<(), FailureStoreError>;

    fn get(&self, id: FailureRecordId) -> Result<Option<FailureRecord>, FailureStoreError>;

    fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<FailureRecord>, FailureStoreError>;

    /// Overwrite an existing record.
    fn update(&self, record: &FailureRecord) -> Result<(), FailureStoreError>;

    /// Records with `retried = false` (exhausted ones included).
    fn find_unretried(&self) -> Result<Vec<FailureRecord>, FailureStoreError>;

    fn find_exhausted(&self) -> Result<Vec<FailureRecord>, FailureStoreError>;

    fn find_by_event_type(&self, event_type: &str) -> Result<Vec<FailureRecord>, FailureStoreError>;

    /// Records created within `[from, to]`.
    fn find_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FailureRecord>, FailureStoreError>;

    fn stats(&self) -> Result<FailureStats, FailureStoreError>;
}

/// Failure store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureStoreError {
    #[error("a failure record for event {event_id} already exists")]
    Duplicate { event_id: Uuid },
    #[error("failure record not found: {0}")]
    NotFound(FailureRecordId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S> FailureStore for Arc<S>
where
    S: FailureStore + ?Sized,
{
    fn insert(&self, record: FailureRecord) -> Result<(), FailureStoreError> {
        (**self).insert(record)
    }

    fn get(&self, id: FailureRecordId) -> Result<Option<FailureRecord>, FailureStoreError> {
        (**self).get(id)
    }

    fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<FailureRecord>, FailureStoreError> {
        (**self).find_by_event_id(event_id)
    }

    fn update(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        (**self).update(record)
    }

    fn find_unretried(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        (**self).find_unretried()
    }

    fn find_exhausted(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        (**self).find_exhausted()
    }

    fn find_by_event_type(&self, event_type: &str) -> Result<Vec<FailureRecord>, FailureStoreError> {
        (**self).find_by_event_type(event_type)
    }

    fn find_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FailureRecord>, FailureStoreError> {
        (**self).find_created_between(from, to)
    }

    fn stats(&self) -> Result<FailureStats, FailureStoreError> {
        (**self).stats()
    }
}

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<FailureRecordId, FailureRecord>,
    by_event: HashMap<Uuid, FailureRecordId>,
}

/// In-memory failure store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryFailureStore {
    records: RwLock<Records>,
}

fn poisoned<T>(_: PoisonError<T>) -> FailureStoreError {
    FailureStoreError::Storage("in-memory failure store lock poisoned".to_string())
}

fn oldest_first(mut records: Vec<FailureRecord>) -> Vec<FailureRecord> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    records
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn select(&self, filter: impl Fn(&FailureRecord) -> bool) -> Result<Vec<FailureRecord>, FailureStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(oldest_first(
            records.by_id.values().filter(|r| filter(r)).cloned().collect(),
        ))
    }
}

impl FailureStore for InMemoryFailureStore {
    fn insert(&self, record: FailureRecord) -> Result<(), FailureStoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records.by_event.contains_key(&record.event_id) {
            return Err(FailureStoreError::Duplicate {
                event_id: record.event_id,
            });
        }
        records.by_event.insert(record.event_id, record.id);
        records.by_id.insert(record.id, record);
        Ok(())
    }

    fn get(&self, id: FailureRecordId) -> Result<Option<FailureRecord>, FailureStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.by_id.get(&id).cloned())
    }

    fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<FailureRecord>, FailureStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .by_event
            .get(&event_id)
            .and_then(|id| records.by_id.get(id))
            .cloned())
    }

    fn update(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        match records.by_id.get_mut(&record.id) {
            Some(existing) if existing.event_id == record.event_id => {
                *existing = record.clone();
                Ok(())
            }
            Some(_) => Err(FailureStoreError::Storage(format!(
                "failure record {} cannot change its event id",
                record.id
            ))),
            None => Err(FailureStoreError::NotFound(record.id)),
        }
    }

    fn find_unretried(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.select(|r| !r.retried)
    }

    fn find_exhausted(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.select(|r| r.exhausted && !r.retried)
    }

    fn find_by_event_type(&self, event_type: &str) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.select(|r| r.event_type == event_type)
    }

    fn find_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.select(|r| r.created_at >= from && r.created_at <= to)
    }

    fn stats(&self) -> Result<FailureStats, FailureStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut stats = FailureStats::default();
        for record in records.by_id.values() {
            stats.count(record);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failures::types::NewFailure;
    use chrono::Duration;

    fn record(event_type: &str) -> FailureRecord {
        FailureRecord::new(NewFailure {
            event_id: Uuid::now_v7(),
            event_type: event_type.to_string(),
            topic: "sales-orders".to_string(),
            payload: b"{}".to_vec(),
            error_message: "broker down".to_string(),
        })
    }

    #[test]
    fn event_id_is_unique() {
        let store = InMemoryFailureStore::new();
        let first = record("sales.order.placed");
        let mut second = record("sales.order.placed");
        second.event_id = first.event_id;

        store.insert(first.clone()).unwrap();
        assert_eq!(
            store.insert(second).unwrap_err(),
            FailureStoreError::Duplicate {
                event_id: first.event_id
            }
        );
        assert_eq!(store.find_by_event_id(first.event_id).unwrap(), Some(first));
    }

    #[test]
    fn unretried_are_oldest_first_with_id_tie_break() {
        let store = InMemoryFailureStore::new();
        let now = Utc::now();

        let mut late = record("a");
        late.created_at = now;
        let mut early = record("a");
        early.created_at = now - Duration::seconds(10);
        let mut tie_a = record("a");
        let mut tie_b = record("a");
        tie_a.created_at = now - Duration::seconds(5);
        tie_b.created_at = tie_a.created_at;
        let mut done = record("a");
        done.mark_retried();

        for r in [&late, &tie_b, &done, &early, &tie_a] {
            store.insert(r.clone()).unwrap();
        }

        let (first_tie, second_tie) = if tie_a.id < tie_b.id { (&tie_a, &tie_b) } else { (&tie_b, &tie_a) };
        let ids: Vec<_> = store.find_unretried().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, first_tie.id, second_tie.id, late.id]);
    }

    #[test]
    fn update_requires_existing_record() {
        let store = InMemoryFailureStore::new();
        let mut r = record("a");
        assert_eq!(store.update(&r).unwrap_err(), FailureStoreError::NotFound(r.id));

        store.insert(r.clone()).unwrap();
        r.mark_exhausted();
        store.update(&r).unwrap();
        assert_eq!(store.find_exhausted().unwrap(), vec![r]);
    }

    #[test]
    fn queries_by_type_and_creation_window() {
        let store = InMemoryFailureStore::new();
        let now = Utc::now();

        let mut old = record("sales.order.placed");
        old.created_at = now - Duration::hours(2);
        let recent = record("sales.order.placed");
        let other = record("inventory.restocked");
        for r in [&old, &recent, &other] {
            store.insert(r.clone()).unwrap();
        }

        assert_eq!(store.find_by_event_type("sales.order.placed").unwrap().len(), 2);
        assert_eq!(store.find_by_event_type("nope").unwrap().len(), 0);

        let window = store
            .find_created_between(now - Duration::hours(3), now - Duration::hours(1))
            .unwrap();
        assert_eq!(window, vec![old]);
        assert_eq!(store.stats().unwrap().total, 3);
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use stockflow_core::FailureRecordId;

use super::store::{FailureStore, FailureStoreError};
use super::types::{FailureRecord, FailureStats, NewFailure};

/// Records failed publications and moves records through their lifecycle.
///
/// Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct FailureTracker {
    store: Arc<dyn FailureStore>,
}

impl core::fmt::Debug for FailureTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FailureTracker").finish_non_exhaustive()
    }
}

impl FailureTracker {
    pub fn new(store: Arc<dyn FailureStore>) -> Self {
        Self { store }
    }

    /// Persist a failed publish. Recording the same event twice returns the
    /// existing record unchanged.
    pub fn record(&self, failure: NewFailure) -> Result<FailureRecord, FailureStoreError> {
        let event_id = failure.event_id;
        let record = FailureRecord::new(failure);

        match self.store.insert(record.clone()) {
            Ok(()) => {
                warn!(
                    failure_id = %record.id,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    topic = %record.topic,
                    error = %record.error_message,
                    "event publication failed; recorded for retry"
                );
                Ok(record)
            }
            Err(FailureStoreError::Duplicate { .. }) => {
                debug!(event_id = %event_id, "failure already recorded for event");
                self.store
                    .find_by_event_id(event_id)?
                    .ok_or_else(|| FailureStoreError::Storage(format!(
                        "duplicate failure for event {event_id} but no record found"
                    )))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: FailureRecordId) -> Result<Option<FailureRecord>, FailureStoreError> {
        self.store.get(id)
    }

    pub fn find_unretried(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.store.find_unretried()
    }

    pub fn find_exhausted(&self) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.store.find_exhausted()
    }

    pub fn find_by_event_type(&self, event_type: &str) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.store.find_by_event_type(event_type)
    }

    pub fn find_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FailureRecord>, FailureStoreError> {
        self.store.find_created_between(from, to)
    }

    pub fn stats(&self) -> Result<FailureStats, FailureStoreError> {
        self.store.stats()
    }

    /// Count a replay attempt before it is made.
    pub fn record_attempt(&self, id: FailureRecordId) -> Result<FailureRecord, FailureStoreError> {
        self.modify(id, FailureRecord::begin_attempt)
    }

    /// Keep the reason the latest replay failed.
    pub fn record_error(&self, id: FailureRecordId, error: &str) -> Result<FailureRecord, FailureStoreError> {
        self.modify(id, |r| r.fail_attempt(error))
    }

    pub fn mark_retried(&self, id: FailureRecordId) -> Result<FailureRecord, FailureStoreError> {
        self.modify(id, FailureRecord::mark_retried)
    }

    pub fn mark_exhausted(&self, id: FailureRecordId) -> Result<FailureRecord, FailureStoreError> {
        self.modify(id, FailureRecord::mark_exhausted)
    }

    /// Re-arm an exhausted record for automatic replay.
    pub fn reset(&self, id: FailureRecordId) -> Result<FailureRecord, FailureStoreError> {
        let record = self.modify(id, FailureRecord::reset)?;
        info!(failure_id = %id, event_id = %record.event_id, "failure record reset for retry");
        Ok(record)
    }

    fn modify(
        &self,
        id: FailureRecordId,
        change: impl FnOnce(&mut FailureRecord),
    ) -> Result<FailureRecord, FailureStoreError> {
        let mut record = self
            .store
            .get(id)?
            .ok_or(FailureStoreError::NotFound(id))?;
        change(&mut record);
        self.store.update(&record)?;
        Ok(record)
    }
}

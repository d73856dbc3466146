//! Failure record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockflow_core::FailureRecordId;

/// Lifecycle of a failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureState {
    /// Waiting for the next replay
    Pending,
    /// Delivered by a replay
    Retried,
    /// Hit the attempt ceiling; needs an operator
    Exhausted,
}

/// A failed publish, as handed to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFailure {
    pub event_id: Uuid,
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub error_message: String,
}

/// A durably recorded failed publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Time-ordered record ID (UUIDv7)
    pub id: FailureRecordId,
    /// ID of the event envelope in `payload`; unique across records
    pub event_id: Uuid,
    pub event_type: String,
    /// Topic the event was bound for
    pub topic: String,
    /// Serialized event envelope, exactly as first attempted
    pub payload: Vec<u8>,
    /// Most recent failure reason
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retried: bool,
    /// Replays attempted so far (the original publish is not counted)
    pub attempt_count: u32,
    pub exhausted: bool,
}

impl FailureRecord {
    pub fn new(failure: NewFailure) -> Self {
        let now = Utc::now();
        Self {
            id: FailureRecordId::new(),
            event_id: failure.event_id,
            event_type: failure.event_type,
            topic: failure.topic,
            payload: failure.payload,
            error_message: failure.error_message,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            retried: false,
            attempt_count: 0,
            exhausted: false,
        }
    }

    pub fn state(&self) -> FailureState {
        if self.retried {
            FailureState::Retried
        } else if self.exhausted {
            FailureState::Exhausted
        } else {
            FailureState::Pending
        }
    }

    /// Eligible for an automatic replay.
    pub fn is_pending(&self) -> bool {
        self.state() == FailureState::Pending
    }

    /// Count one more replay attempt.
    pub fn begin_attempt(&mut self) {
        let now = Utc::now();
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail_attempt(&mut self, error_message: impl Into<String>) {
        self.error_message = error_message.into();
        self.updated_at = Utc::now();
    }

    pub fn mark_retried(&mut self) {
        self.retried = true;
        self.updated_at = Utc::now();
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
        self.updated_at = Utc::now();
    }

    /// Operator re-arm: back to pending with a fresh attempt budget.
    pub fn reset(&mut self) {
        self.exhausted = false;
        self.retried = false;
        self.attempt_count = 0;
        self.updated_at = Utc::now();
    }
}

/// Counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureStats {
    pub total: usize,
    pub pending: usize,
    pub retried: usize,
    pub exhausted: usize,
}

impl FailureStats {
    pub fn count(&mut self, record: &FailureRecord) {
        self.total += 1;
        match record.state() {
            FailureState::Pending => self.pending += 1,
            FailureState::Retried => self.retried += 1,
            FailureState::Exhausted => self.exhausted += 1,
        }
    }
}

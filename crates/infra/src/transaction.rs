//! Business transactions with post-commit event publication.
//!
//! A [`Transaction`] collects two things while the business work runs:
//!
//! - **pending events**, serialized envelopes raised through the publisher;
//! - **compensations**, closures that undo a side effect already applied to a
//!   store (e.g. restoring decremented stock).
//!
//! Commit hands the pending events back for publication and forgets the
//! compensations. Rollback runs the compensations newest-first and discards
//! the events, so nothing is ever published for work that did not commit.
//! A transaction dropped while still active (early return, panic) rolls back.
//!
//! A compensation that fails is not retried here; every step still runs and
//! the failed ones are reported together as a [`RollbackError`].

use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use stockflow_core::RequestContext;

use crate::publisher::EventPublisher;

/// A serialized event waiting for its transaction to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// Rollback ran but left some side effects in place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "transaction {transaction_id} rolled back ({cause}) but could not undo: {steps}",
    steps = .unreverted.join("; ")
)]
pub struct RollbackError {
    pub transaction_id: Uuid,
    /// What triggered the rollback.
    pub cause: String,
    /// `label: error` for each compensation that failed, newest first.
    pub unreverted: Vec<String>,
}

type CompensationFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct Compensation {
    label: String,
    action: CompensationFn,
}

pub struct Transaction {
    id: Uuid,
    context: RequestContext,
    state: TransactionState,
    pending: Vec<PendingEvent>,
    compensations: Vec<Compensation>,
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field(
                "compensations",
                &self.compensations.iter().map(|c| c.label.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Transaction {
    pub fn begin(context: RequestContext) -> Self {
        Self {
            id: Uuid::now_v7(),
            context,
            state: TransactionState::Active,
            pending: Vec::new(),
            compensations: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn pending_events(&self) -> &[PendingEvent] {
        &self.pending
    }

    pub(crate) fn enqueue(&mut self, event: PendingEvent) {
        self.pending.push(event);
    }

    /// Register an undo step for a side effect that has already been applied.
    pub fn on_rollback<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.compensations.push(Compensation {
            label: label.into(),
            action: Box::new(action),
        });
    }

    /// Commit and take the events that are now allowed to be published.
    pub fn commit(mut self) -> Vec<PendingEvent> {
        self.state = TransactionState::Committed;
        self.compensations.clear();
        debug!(
            transaction_id = %self.id,
            correlation_id = %self.context.correlation_id(),
            events = self.pending.len(),
            "transaction committed"
        );
        std::mem::take(&mut self.pending)
    }

    /// Undo every registered side effect and drop the pending events.
    pub fn rollback(self) -> Result<(), RollbackError> {
        self.rollback_because("rollback requested")
    }

    /// Like [`rollback`](Self::rollback), recording `cause` in any error.
    pub fn rollback_because(mut self, cause: impl Into<String>) -> Result<(), RollbackError> {
        self.roll_back_in_place(cause.into())
    }

    fn roll_back_in_place(&mut self, cause: String) -> Result<(), RollbackError> {
        self.state = TransactionState::RolledBack;
        let discarded = self.pending.len();
        self.pending.clear();

        let mut unreverted = Vec::new();
        while let Some(Compensation { label, action }) = self.compensations.pop() {
            if let Err(e) = action() {
                // Older steps are independent of this one.
                error!(
                    transaction_id = %self.id,
                    compensation = %label,
                    error = %e,
                    "compensation failed during rollback"
                );
                unreverted.push(format!("{label}: {e}"));
            }
        }

        debug!(
            transaction_id = %self.id,
            correlation_id = %self.context.correlation_id(),
            discarded_events = discarded,
            unreverted = unreverted.len(),
            "transaction rolled back"
        );

        if unreverted.is_empty() {
            Ok(())
        } else {
            Err(RollbackError {
                transaction_id: self.id,
                cause,
                unreverted,
            })
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            // Already logged per step; there is no caller left to hand it to.
            let _ = self.roll_back_in_place("dropped while active".to_string());
        }
    }
}

/// Runs business work in a transaction and publishes what it raised once it
/// has committed.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    publisher: EventPublisher,
}

impl UnitOfWork {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// `Ok` commits then publishes; `Err` rolls back and publishes nothing.
    ///
    /// Publication failures never reach the caller: they end up as failure
    /// records for the retry scheduler. A rollback that could not undo every
    /// step replaces the work's error with the [`RollbackError`], which names
    /// the original cause.
    pub fn run<T, E, F>(&self, context: &RequestContext, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
        E: core::fmt::Display + From<RollbackError>,
    {
        let mut tx = Transaction::begin(context.clone());

        match work(&mut tx) {
            Ok(value) => {
                let events = tx.commit();
                self.publisher.publish_committed(events);
                Ok(value)
            }
            Err(e) => {
                debug!(transaction_id = %tx.id(), error = %e, "transaction work failed");
                match tx.rollback_because(e.to_string()) {
                    Ok(()) => Err(e),
                    Err(unreverted) => {
                        error!(error = %unreverted, "rollback left the transaction partially applied");
                        Err(E::from(unreverted))
                    }
                }
            }
        }
    }
}

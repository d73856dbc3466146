//! Retry scheduler: periodically replays recorded publication failures.
//!
//! Each sweep walks the un-retried failure records oldest first. A record's
//! attempt counter is persisted *before* the replay, so a crash mid-replay can
//! never hand out free attempts. Records that reach the attempt ceiling are
//! flagged exhausted and left for an operator.
//!
//! Sweeps never overlap: a trigger that arrives while a sweep is running is
//! skipped. Shutdown lets an in-flight sweep finish before the worker exits.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::failures::{FailureRecord, FailureStoreError, FailureTracker};
use crate::publisher::{EventPublisher, PublishOutcome};

/// Retry scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedulerConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Replays per record before it is flagged exhausted
    pub max_attempts: u32,
    /// Name for logging and the worker thread
    pub name: String,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_attempts: 10,
            name: "failed-event-retry".to_string(),
        }
    }
}

impl RetrySchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub sweeps: u64,
    /// Triggers dropped because a sweep was already running
    pub skipped: u64,
    pub delivered: u64,
    pub failed: u64,
    pub exhausted: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Records that hit the ceiling during this sweep
    pub exhausted: usize,
    /// Records passed over because they were already exhausted
    pub already_exhausted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was in progress.
    Skipped,
}

/// Clears the running flag however the sweep ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Replay {
    Delivered,
    Failed { exhausted: bool },
    Skipped,
}

/// Replays failure records through the event publisher.
///
/// Cheap to clone; clones share the running flag and statistics, so a manual
/// `run_once` and the background worker never sweep at the same time.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    publisher: EventPublisher,
    tracker: FailureTracker,
    config: RetrySchedulerConfig,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl RetryScheduler {
    pub fn new(publisher: EventPublisher, config: RetrySchedulerConfig) -> Self {
        let tracker = publisher.tracker().clone();
        Self {
            publisher,
            tracker,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    pub fn config(&self) -> &RetrySchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one sweep now, unless one is already running.
    pub fn run_once(&self) -> SweepOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(scheduler = %self.config.name, "sweep already running; trigger skipped");
            self.update_stats(|s| s.skipped += 1);
            return SweepOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let report = self.sweep();
        self.update_stats(|s| {
            s.sweeps += 1;
            s.delivered += report.delivered as u64;
            s.failed += report.failed as u64;
            s.exhausted += report.exhausted as u64;
            s.last_sweep_at = Some(Utc::now());
        });
        SweepOutcome::Completed(report)
    }

    fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let records = match self.tracker.find_unretried() {
            Ok(records) => records,
            Err(e) => {
                error!(scheduler = %self.config.name, error = %e, "failed to load failure records");
                return report;
            }
        };

        for record in records {
            report.examined += 1;
            let id = record.id;

            let replayed = catch_unwind(AssertUnwindSafe(|| self.replay_record(record)));
            match replayed {
                Ok(Ok(Replay::Delivered)) => report.delivered += 1,
                Ok(Ok(Replay::Failed { exhausted })) => {
                    report.failed += 1;
                    if exhausted {
                        report.exhausted += 1;
                    }
                }
                Ok(Ok(Replay::Skipped)) => report.already_exhausted += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(scheduler = %self.config.name, failure_id = %id, error = %e, "failure record bookkeeping failed");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(scheduler = %self.config.name, failure_id = %id, "replay panicked");
                }
            }
        }

        if report.examined > 0 {
            info!(
                scheduler = %self.config.name,
                examined = report.examined,
                delivered = report.delivered,
                failed = report.failed,
                exhausted = report.exhausted,
                "retry sweep finished"
            );
        }
        report
    }

    fn replay_record(&self, record: FailureRecord) -> Result<Replay, FailureStoreError> {
        if record.exhausted {
            return Ok(Replay::Skipped);
        }

        if record.attempt_count >= self.config.max_attempts {
            // Ceiling lowered since the last sweep.
            self.exhaust(&record)?;
            return Ok(Replay::Failed { exhausted: true });
        }

        let record = self.tracker.record_attempt(record.id)?;

        let error = match self.publisher.replay(&record) {
            Ok(PublishOutcome::Delivered) => {
                self.tracker.mark_retried(record.id)?;
                info!(
                    failure_id = %record.id,
                    event_id = %record.event_id,
                    attempt = record.attempt_count,
                    "failed event republished"
                );
                return Ok(Replay::Delivered);
            }
            Ok(PublishOutcome::Failed(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        let record = self.tracker.record_error(record.id, &error)?;
        debug!(
            failure_id = %record.id,
            attempt = record.attempt_count,
            error = %error,
            "replay failed"
        );

        if record.attempt_count >= self.config.max_attempts {
            self.exhaust(&record)?;
            return Ok(Replay::Failed { exhausted: true });
        }
        Ok(Replay::Failed { exhausted: false })
    }

    fn exhaust(&self, record: &FailureRecord) -> Result<(), FailureStoreError> {
        self.tracker.mark_exhausted(record.id)?;
        warn!(
            failure_id = %record.id,
            event_id = %record.event_id,
            event_type = %record.event_type,
            attempts = record.attempt_count,
            last_error = %record.error_message,
            "failed event exhausted its retries; operator action required"
        );
        Ok(())
    }

    fn update_stats(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }

    /// Start sweeping every `config.interval` on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<RetrySchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let scheduler = self.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || scheduler_loop(scheduler, shutdown_rx))?;

        Ok(RetrySchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            scheduler: self,
        })
    }
}

fn scheduler_loop(scheduler: RetryScheduler, shutdown_rx: mpsc::Receiver<()>) {
    let name = scheduler.config.name.clone();
    info!(scheduler = %name, interval_secs = scheduler.config.interval.as_secs(), "retry scheduler started");

    loop {
        match shutdown_rx.recv_timeout(scheduler.config.interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if catch_unwind(AssertUnwindSafe(|| scheduler.run_once())).is_err() {
                    error!(scheduler = %name, "retry sweep panicked; worker continues");
                }
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(scheduler = %name, "retry scheduler stopped");
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct RetrySchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    scheduler: RetryScheduler,
}

impl RetrySchedulerHandle {
    /// Stop the worker, waiting for an in-flight sweep to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Manual trigger; skipped if the worker is mid-sweep.
    pub fn run_once(&self) -> SweepOutcome {
        self.scheduler.run_once()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Instant;

    use stockflow_core::RequestContext;
    use stockflow_events::{InMemoryTransport, Transport, TransportError};

    use crate::failures::{FailureState, InMemoryFailureStore, NewFailure};
    use crate::publisher::PublisherConfig;
    use crate::transaction::Transaction;

    fn setup(max_attempts: u32) -> (Arc<InMemoryTransport>, FailureTracker, RetryScheduler) {
        let transport = Arc::new(InMemoryTransport::new());
        let tracker = FailureTracker::new(InMemoryFailureStore::arc());
        let publisher = EventPublisher::new(transport.clone(), tracker.clone(), PublisherConfig::default());
        let scheduler = RetryScheduler::new(
            publisher,
            RetrySchedulerConfig::default().with_max_attempts(max_attempts),
        );
        (transport, tracker, scheduler)
    }

    /// A real envelope recorded as failed.
    fn failed_event(scheduler: &RetryScheduler, transport: &InMemoryTransport) -> FailureRecord {
        #[derive(Debug, Clone, serde::Serialize)]
        struct Ping;

        impl stockflow_events::Event for Ping {
            fn event_type(&self) -> &'static str {
                "test.ping"
            }
            fn version(&self) -> u32 {
                1
            }
            fn occurred_at(&self) -> DateTime<Utc> {
                Utc::now()
            }
            fn aggregate_id(&self) -> uuid::Uuid {
                uuid::Uuid::nil()
            }
        }

        transport.set_available(false);
        let mut tx = Transaction::begin(RequestContext::system());
        scheduler.publisher.raise(&mut tx, Ping).unwrap();
        let report = scheduler.publisher.publish_committed(tx.commit()).remove(0);
        report.failure.unwrap()
    }

    fn completed(outcome: SweepOutcome) -> SweepReport {
        match outcome {
            SweepOutcome::Completed(report) => report,
            SweepOutcome::Skipped => panic!("sweep unexpectedly skipped"),
        }
    }

    #[test]
    fn healthy_transport_marks_record_retried_after_one_attempt() {
        let (transport, tracker, scheduler) = setup(10);
        let record = failed_event(&scheduler, &transport);
        transport.set_available(true);

        let report = completed(scheduler.run_once());
        assert_eq!(report.delivered, 1);

        let after = tracker.get(record.id).unwrap().unwrap();
        assert!(after.retried);
        assert_eq!(after.attempt_count, 1);
        assert_eq!(transport.published_to("sales-orders").len(), 1);

        // Nothing left to do; no duplicate publish.
        let report = completed(scheduler.run_once());
        assert_eq!(report.examined, 0);
        assert_eq!(transport.published_to("sales-orders").len(), 1);
    }

    #[test]
    fn failing_replays_keep_error_and_count() {
        let (transport, tracker, scheduler) = setup(10);
        let record = failed_event(&scheduler, &transport);

        completed(scheduler.run_once());
        completed(scheduler.run_once());

        let after = tracker.get(record.id).unwrap().unwrap();
        assert!(!after.retried);
        assert_eq!(after.attempt_count, 2);
        assert!(after.last_attempt_at.is_some());
        assert!(after.error_message.contains("broker is down"));

        let stats = scheduler.stats();
        assert_eq!(stats.sweeps, 2);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn record_is_exhausted_at_the_ceiling() {
        let (transport, tracker, scheduler) = setup(3);
        let record = failed_event(&scheduler, &transport);

        for _ in 0..3 {
            completed(scheduler.run_once());
        }
        let after = tracker.get(record.id).unwrap().unwrap();
        assert_eq!(after.state(), FailureState::Exhausted);
        assert_eq!(after.attempt_count, 3);
        assert_eq!(scheduler.stats().exhausted, 1);

        // Excluded from further automatic attempts, even once the broker is back.
        transport.set_available(true);
        let report = completed(scheduler.run_once());
        assert_eq!(report.already_exhausted, 1);
        assert_eq!(tracker.get(record.id).unwrap().unwrap().attempt_count, 3);

        // Operator reset re-arms it.
        tracker.reset(record.id).unwrap();
        let report = completed(scheduler.run_once());
        assert_eq!(report.delivered, 1);
    }

    #[test]
    fn undecodable_payload_is_isolated() {
        let (transport, tracker, scheduler) = setup(10);
        let good = failed_event(&scheduler, &transport);
        let bad = tracker
            .record(NewFailure {
                event_id: uuid::Uuid::now_v7(),
                event_type: "test.ping".to_string(),
                topic: "sales-orders".to_string(),
                payload: b"\xff not an envelope".to_vec(),
                error_message: "broker down".to_string(),
            })
            .unwrap();
        transport.set_available(true);

        let report = completed(scheduler.run_once());
        assert_eq!(report.examined, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);

        assert!(tracker.get(good.id).unwrap().unwrap().retried);
        let bad = tracker.get(bad.id).unwrap().unwrap();
        assert!(!bad.retried);
        assert!(bad.error_message.contains("undecodable"));
    }

    #[derive(Debug)]
    struct Gate {
        entered: Barrier,
        release: Barrier,
    }

    impl Transport for Gate {
        fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<(), TransportError> {
            self.entered.wait();
            self.release.wait();
            Ok(())
        }
    }

    #[test]
    fn overlapping_trigger_is_skipped() {
        let store = InMemoryFailureStore::arc();
        let tracker = FailureTracker::new(store);

        // Record a failure with a valid envelope through a down transport first.
        let down = Arc::new(InMemoryTransport::new());
        let seeding = RetryScheduler::new(
            EventPublisher::new(down.clone(), tracker.clone(), PublisherConfig::default()),
            RetrySchedulerConfig::default(),
        );
        failed_event(&seeding, &down);

        let gate = Arc::new(Gate {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let scheduler = RetryScheduler::new(
            EventPublisher::new(gate.clone(), tracker.clone(), PublisherConfig::default()),
            RetrySchedulerConfig::default(),
        );

        let background = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.run_once())
        };

        gate.entered.wait();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.run_once(), SweepOutcome::Skipped);
        gate.release.wait();

        let report = completed(background.join().unwrap());
        assert_eq!(report.delivered, 1);
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.stats().skipped, 1);
    }

    #[test]
    fn shutdown_lets_the_running_sweep_finish() {
        let tracker = FailureTracker::new(InMemoryFailureStore::arc());
        let down = Arc::new(InMemoryTransport::new());
        let seeding = RetryScheduler::new(
            EventPublisher::new(down.clone(), tracker.clone(), PublisherConfig::default()),
            RetrySchedulerConfig::default(),
        );
        let record = failed_event(&seeding, &down);

        let gate = Arc::new(Gate {
            entered: Barrier::new(2),
            release: Barrier::new(2),
        });
        let scheduler = RetryScheduler::new(
            EventPublisher::new(gate.clone(), tracker.clone(), PublisherConfig::default()),
            RetrySchedulerConfig::default().with_interval(Duration::from_millis(10)),
        );
        let observer = scheduler.clone();
        let handle = scheduler.spawn().unwrap();

        // The worker is now blocked inside the replay.
        gate.entered.wait();
        assert!(observer.is_running());

        let stopper = thread::spawn(move || handle.shutdown());
        thread::sleep(Duration::from_millis(50));
        assert!(!stopper.is_finished(), "shutdown returned before the sweep finished");

        gate.release.wait();
        stopper.join().unwrap();

        assert!(!observer.is_running());
        assert!(tracker.get(record.id).unwrap().unwrap().retried);
        let stats = observer.stats();
        assert_eq!(stats.sweeps, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn spawned_worker_sweeps_and_shuts_down() {
        let (transport, tracker, scheduler) = setup(10);
        let record = failed_event(&scheduler, &transport);
        transport.set_available(true);

        let worker = RetryScheduler::new(
            scheduler.publisher.clone(),
            RetrySchedulerConfig::default().with_interval(Duration::from_millis(10)),
        );
        let handle = worker.spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !tracker.get(record.id).unwrap().unwrap().retried && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.stats().sweeps >= 1);
        handle.shutdown();

        assert!(tracker.get(record.id).unwrap().unwrap().retried);
    }
}

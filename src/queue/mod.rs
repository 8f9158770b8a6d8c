mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use self::store::{JobStatus, JobStore, OperationJob, QueueSummary};
use crate::device::DeviceKind;
use crate::error::QueueError;
use crate::events::{DeviceEvent, EventFabric, EventKind};

/// Executes one claimed job against the owning adapter or connection.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs the operation. `Ok` carries a result payload stored with the
    /// attempt; `Err` carries the failure message recorded on the row.
    async fn run(&self, job: &OperationJob) -> Result<Value, String>;
}

/// Result of one finished attempt, delivered to a submit-and-wait caller.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub job: OperationJob,
    pub result: Option<Value>,
}

/// Durable FIFO of device operations.
///
/// One worker serialises all `pending → processing` transitions. It wakes on
/// enqueue and on the retry tick; each pass attempts every distinct pending
/// job at most once, so a failing job waits a full retry interval before its
/// next attempt.
pub struct OperationQueue {
    store: Arc<JobStore>,
    wake: Arc<Notify>,
    retry_interval: Duration,
    max_retry_attempts: u32,
    events: Arc<EventFabric>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<AttemptOutcome>>>>,
}

impl OperationQueue {
    #[must_use]
    pub fn new(
        store: Arc<JobStore>,
        retry_interval: Duration,
        max_retry_attempts: u32,
        events: Arc<EventFabric>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            wake: Arc::new(Notify::new()),
            retry_interval,
            max_retry_attempts,
            events,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Persists a new job and wakes the worker. Never waits for execution.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unwritable.
    pub async fn enqueue(
        &self,
        device_id: &str,
        device_kind: DeviceKind,
        operation: &str,
        params: Value,
    ) -> Result<OperationJob, QueueError> {
        let store = Arc::clone(&self.store);
        let device_id = device_id.to_owned();
        let operation = operation.to_owned();
        let job = tokio::task::spawn_blocking(move || {
            store.enqueue(&device_id, device_kind, &operation, &params)
        })
        .await
        .map_err(|_| QueueError::WorkerGone)??;
        self.wake.notify_one();
        Ok(job)
    }

    /// Persists a new job and waits for its first attempt to finish, up to
    /// `wait`. On timeout the job stays queued and its current row returns.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unwritable.
    pub async fn submit_and_wait(
        &self,
        device_id: &str,
        device_kind: DeviceKind,
        operation: &str,
        params: Value,
        wait: Duration,
    ) -> Result<AttemptOutcome, QueueError> {
        let store = Arc::clone(&self.store);
        let owned_device = device_id.to_owned();
        let owned_operation = operation.to_owned();
        let job = tokio::task::spawn_blocking(move || {
            store.enqueue(&owned_device, device_kind, &owned_operation, &params)
        })
        .await
        .map_err(|_| QueueError::WorkerGone)??;

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("queue waiters lock poisoned")
            .entry(job.job_id.clone())
            .or_default()
            .push(tx);
        self.wake.notify_one();

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            _ => {
                // First attempt still outstanding; report the row as stored.
                let current = self.get(&job.job_id).await?.unwrap_or(job);
                Ok(AttemptOutcome {
                    job: current,
                    result: None,
                })
            }
        }
    }

    /// Cancels a pending or processing job. Advisory for processing jobs: an
    /// in-flight adapter call is not aborted, only further retries stop.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let store = Arc::clone(&self.store);
        let job_id = job_id.to_owned();
        tokio::task::spawn_blocking(move || store.cancel(&job_id))
            .await
            .map_err(|_| QueueError::WorkerGone)?
    }

    /// Returns a failed or cancelled job to pending and wakes the worker.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn retry(&self, job_id: &str) -> Result<bool, QueueError> {
        let store = Arc::clone(&self.store);
        let owned = job_id.to_owned();
        let applied = tokio::task::spawn_blocking(move || store.retry(&owned))
            .await
            .map_err(|_| QueueError::WorkerGone)??;
        if applied {
            self.wake.notify_one();
        }
        Ok(applied)
    }

    /// Fetches one job row.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn get(&self, job_id: &str) -> Result<Option<OperationJob>, QueueError> {
        let store = Arc::clone(&self.store);
        let job_id = job_id.to_owned();
        tokio::task::spawn_blocking(move || store.get(&job_id))
            .await
            .map_err(|_| QueueError::WorkerGone)?
    }

    /// Lists job rows newest-first.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn list(
        &self,
        device_id: Option<String>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<OperationJob>, QueueError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.list(device_id.as_deref(), status, limit))
            .await
            .map_err(|_| QueueError::WorkerGone)?
    }

    /// Aggregated per-status counts and mean completion time.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub async fn summary(&self) -> Result<QueueSummary, QueueError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.summary())
            .await
            .map_err(|_| QueueError::WorkerGone)?
    }

    /// Spawns the single processing worker.
    pub fn spawn_worker(
        self: &Arc<Self>,
        runner: Arc<dyn JobRunner>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.wake.notified() => {}
                    _ = tokio::time::sleep(queue.retry_interval) => {}
                }
                queue.drain_pass(runner.as_ref()).await;
            }
            debug!("queue worker stopped");
        })
    }

    /// Attempts every currently-pending job once.
    async fn drain_pass(&self, runner: &dyn JobRunner) {
        let mut attempted: Vec<String> = Vec::new();
        loop {
            let store = Arc::clone(&self.store);
            let exclude = attempted.clone();
            let claimed = tokio::task::spawn_blocking(move || store.claim_oldest_pending(&exclude))
                .await
                .unwrap_or(Ok(None));
            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "queue claim failed; retrying next tick");
                    break;
                }
            };
            attempted.push(job.job_id.clone());
            self.attempt(runner, job).await;
        }
    }

    async fn attempt(&self, runner: &dyn JobRunner, job: OperationJob) {
        let outcome = runner.run(&job).await;

        let store = Arc::clone(&self.store);
        let job_id = job.job_id.clone();
        let max_retry_attempts = self.max_retry_attempts;
        let retry_count = job.retry_count;
        let result_value = outcome.as_ref().ok().cloned();
        let finalise = match &outcome {
            Ok(_) => {
                let id = job_id.clone();
                tokio::task::spawn_blocking(move || store.mark_completed(&id)).await
            }
            Err(message) => {
                let id = job_id.clone();
                let message = message.clone();
                tokio::task::spawn_blocking(move || {
                    if retry_count + 1 < max_retry_attempts {
                        store.mark_retry(&id, &message)
                    } else {
                        store.mark_failed(&id, &message)
                    }
                })
                .await
            }
        };
        if let Ok(Err(error)) = finalise {
            warn!(%error, %job_id, "failed to record job outcome");
        }

        let stored = self.get(&job_id).await.ok().flatten();
        let Some(stored) = stored else {
            return;
        };

        if stored.status == JobStatus::Failed {
            self.events.publish(
                DeviceEvent::new(EventKind::Error, &stored.device_id, stored.device_kind)
                    .with_data(serde_json::json!({
                        "job_id": stored.job_id,
                        "operation": stored.operation,
                        "error": stored.error,
                    })),
            );
        }

        let waiters = self
            .waiters
            .lock()
            .expect("queue waiters lock poisoned")
            .remove(&job_id)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(AttemptOutcome {
                job: stored.clone(),
                result: result_value.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    struct ScriptedRunner {
        failures: AtomicU32,
    }

    impl ScriptedRunner {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(times),
            })
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(&self, _job: &OperationJob) -> Result<Value, String> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err("device unreachable".to_owned())
            } else {
                Ok(serde_json::json!({"bytes_written": 5}))
            }
        }
    }

    // Real (short) retry intervals: the worker mixes timers with blocking
    // store calls, which does not play well with a paused clock.
    const TEST_RETRY_INTERVAL: Duration = Duration::from_millis(50);

    fn queue() -> (Arc<OperationQueue>, tokio::sync::mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, rx) = EventFabric::new();
        let store = Arc::new(JobStore::open_in_memory().expect("store opens"));
        (
            OperationQueue::new(store, TEST_RETRY_INTERVAL, 3, events),
            rx,
        )
    }

    async fn wait_for_status(
        queue: &OperationQueue,
        job_id: &str,
        expected: JobStatus,
    ) -> OperationJob {
        for _ in 0..100 {
            let stored = queue
                .get(job_id)
                .await
                .expect("get succeeds")
                .expect("job exists");
            if stored.status == expected {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job `{job_id}` never reached {expected}");
    }

    #[tokio::test]
    async fn job_completes_after_two_failures_with_retry_count_two() {
        let (queue, _events) = queue();
        let cancel = CancellationToken::new();
        let worker = queue.spawn_worker(ScriptedRunner::failing(2), cancel.clone());

        let job = queue
            .enqueue(
                "printer_office",
                DeviceKind::Printer,
                "printer.print",
                serde_json::json!({"data": "54455354"}),
            )
            .await
            .expect("enqueue succeeds");

        let stored = wait_for_status(&queue, &job.job_id, JobStatus::Completed).await;
        assert_eq!(2, stored.retry_count);

        cancel.cancel();
        worker.await.expect("worker joins");
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally_and_publish_error() {
        let (queue, mut events) = queue();
        let cancel = CancellationToken::new();
        let worker = queue.spawn_worker(ScriptedRunner::failing(10), cancel.clone());

        let job = queue
            .enqueue(
                "printer_office",
                DeviceKind::Printer,
                "printer.print",
                serde_json::json!({}),
            )
            .await
            .expect("enqueue succeeds");

        let stored = wait_for_status(&queue, &job.job_id, JobStatus::Failed).await;
        assert_eq!(2, stored.retry_count);
        assert_eq!(Some("device unreachable"), stored.error.as_deref());

        let event = events.recv().await.expect("error event expected");
        assert_eq!(EventKind::Error, event.event_type);
        assert_eq!("printer_office", event.device_id);

        cancel.cancel();
        worker.await.expect("worker joins");
    }

    #[tokio::test]
    async fn submit_and_wait_returns_the_first_attempt() {
        let (queue, _events) = queue();
        let cancel = CancellationToken::new();
        let worker = queue.spawn_worker(ScriptedRunner::failing(0), cancel.clone());

        let outcome = queue
            .submit_and_wait(
                "printer_office",
                DeviceKind::Printer,
                "printer.print",
                serde_json::json!({"data": "54455354"}),
                Duration::from_secs(10),
            )
            .await
            .expect("submit succeeds");

        assert_eq!(JobStatus::Completed, outcome.job.status);
        assert_eq!(
            Some(serde_json::json!({"bytes_written": 5})),
            outcome.result
        );

        cancel.cancel();
        worker.await.expect("worker joins");
    }

    #[tokio::test]
    async fn cancelled_job_is_not_retried() {
        let (queue, _events) = queue();
        let cancel = CancellationToken::new();
        let worker = queue.spawn_worker(ScriptedRunner::failing(u32::MAX), cancel.clone());

        let job = queue
            .enqueue("printer_office", DeviceKind::Printer, "printer.print", Value::Null)
            .await
            .expect("enqueue succeeds");

        assert!(queue.cancel(&job.job_id).await.expect("cancel succeeds"));
        tokio::time::sleep(TEST_RETRY_INTERVAL * 6).await;

        let stored = queue
            .get(&job.job_id)
            .await
            .expect("get succeeds")
            .expect("job exists");
        assert_eq!(JobStatus::Cancelled, stored.status);
        // Cancelling twice is a no-op.
        assert!(!queue.cancel(&job.job_id).await.expect("cancel succeeds"));

        cancel.cancel();
        worker.await.expect("worker joins");
    }
}

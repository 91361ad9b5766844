//! Dispatch queue and task execution.
//!
//! A [`DispatchQueue`] is one queue generation: tasks are admitted in FIFO
//! order by a driver that holds a semaphore with `concurrency` permits, so
//! at most that many run at once while the rest wait queued.
//! [`DispatchQueue::run`] closes the generation and waits until every task
//! has concluded. Task failures never surface there; each task records its
//! own outcome through the shared [`TaskContext`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::buffer::ResultSink;
use crate::hooks::{ErrorHook, ProgressThrottle, ProgressUpdate, ResponseHook};
use crate::record::{Batch, Record};
use crate::request::{HeaderList, HttpExecutor, HttpResponse, RequestError, ResponseBody};
use crate::retry::RetryStrategy;

/// Outcome stored in the result buffer, one per concluded task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseRecord {
    /// The task's request succeeded.
    Success(SuccessRecord),
    /// The task failed after retries, or with a non-retryable error.
    Failure(FailureRecord),
}

impl ResponseRecord {
    /// Returns true for successful outcomes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessRecord {
    /// HTTP status; `0` for dry runs.
    pub status: u16,
    /// Response headers, when enabled in the run configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderList>,
    /// Decoded body.
    pub body: ResponseBody,
}

/// A failed task, with the batch that could not be delivered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Error message.
    pub message: String,
    /// HTTP status of the last response, if there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Body of the last response, if there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request URL.
    pub url: String,
    /// Request method, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Milliseconds since the Unix epoch when the task concluded.
    pub timestamp: u64,
    /// The undelivered records.
    pub batch: Vec<Record>,
}

impl FailureRecord {
    /// Builds a failure record from the task's final error.
    #[must_use]
    pub fn new(error: &RequestError, batch: Batch) -> Self {
        Self {
            message: error.to_string(),
            status_code: error.status_code(),
            body: error.body().map(str::to_string),
            url: error.url().to_string(),
            method: error.method().map(str::to_string),
            timestamp: unix_millis(),
            batch: batch.into_records(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Counters shared by every task of one run.
///
/// Atomic so concurrently finishing tasks can update them without a lock.
#[derive(Debug, Default)]
pub struct RunCounters {
    requests: AtomicU64,
    rows: AtomicU64,
    errors: AtomicU64,
    retried: AtomicU64,
    submitted: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    in_flight_bytes: AtomicUsize,
}

impl RunCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks that concluded successfully.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Records in successful tasks.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::SeqCst)
    }

    /// Tasks that concluded with an error.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Retry attempts made across all tasks.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::SeqCst)
    }

    /// Tasks handed to any queue generation.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Tasks executing right now.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously executing tasks observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Estimated payload bytes of submitted, unconcluded batches.
    #[must_use]
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes.load(Ordering::SeqCst)
    }

    /// Progress snapshot.
    #[must_use]
    pub fn progress(&self) -> ProgressUpdate {
        ProgressUpdate {
            completed: self.requests() + self.errors(),
            total: self.submitted(),
            records: self.rows(),
        }
    }

    pub(crate) fn increment_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Adds `bytes` to the in-flight estimate, returning the new total.
    pub(crate) fn reserve_bytes(&self, bytes: usize) -> usize {
        self.in_flight_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub(crate) fn release_bytes(&self, bytes: usize) {
        self.in_flight_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn record_success(&self, rows: usize) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.rows
            .fetch_add(u64::try_from(rows).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One queue generation with bounded concurrency and FIFO admission.
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    driver: JoinHandle<()>,
    queued: usize,
    concurrency: usize,
}

impl DispatchQueue {
    /// Starts a generation allowing `concurrency` simultaneous tasks (at least 1).
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let driver = tokio::spawn(async move {
            let mut running = JoinSet::new();
            while let Some(task) = receiver.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    warn!("dispatch semaphore closed, dropping queued tasks");
                    break;
                };
                running.spawn(async move {
                    let _permit = permit;
                    task.await;
                });
            }
            while let Some(joined) = running.join_next().await {
                if let Err(error) = joined {
                    warn!(error = %error, "dispatch task panicked");
                }
            }
        });

        Self {
            sender,
            driver,
            queued: 0,
            concurrency,
        }
    }

    /// Concurrency limit of this generation.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks added to this generation.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Enqueues a task; it starts once a permit is free and earlier tasks were admitted.
    pub fn add<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queued += 1;
        if self.sender.send(task.boxed()).is_err() {
            warn!("dispatch driver stopped, task dropped");
        }
    }

    /// Closes the generation and waits for every added task to conclude.
    pub async fn run(self) {
        let Self {
            sender,
            driver,
            queued,
            ..
        } = self;
        drop(sender);
        debug!(tasks = queued, "draining queue generation");
        if let Err(error) = driver.await {
            warn!(error = %error, "dispatch driver panicked");
        }
    }
}

/// Everything a task needs, shared by all tasks of a run.
pub struct TaskContext {
    executor: HttpExecutor,
    retry: RetryStrategy,
    counters: Arc<RunCounters>,
    sink: Mutex<ResultSink<ResponseRecord>>,
    on_response: Option<ResponseHook>,
    on_error: Option<ErrorHook>,
    include_headers: bool,
    request_delay: Duration,
    progress: ProgressThrottle,
}

impl TaskContext {
    /// Wires the collaborators for one run.
    #[must_use]
    pub(crate) fn new(
        executor: HttpExecutor,
        counters: Arc<RunCounters>,
        sink: ResultSink<ResponseRecord>,
        on_response: Option<ResponseHook>,
        on_error: Option<ErrorHook>,
        progress: ProgressThrottle,
    ) -> Self {
        let config = executor.config();
        Self {
            retry: RetryStrategy::new(config.retry().clone()),
            include_headers: config.include_response_headers(),
            request_delay: config.request_delay(),
            executor,
            counters,
            sink: Mutex::new(sink),
            on_response,
            on_error,
            progress,
        }
    }

    /// Shared run counters.
    #[must_use]
    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    pub(crate) fn progress(&self) -> &ProgressThrottle {
        &self.progress
    }

    /// Removes and returns every stored outcome, oldest first.
    pub(crate) fn take_responses(&self) -> Vec<ResponseRecord> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).drain()
    }

    /// Sends one batch with retries and records the outcome.
    ///
    /// `reserved_bytes` is released from the in-flight estimate once the
    /// outcome is known.
    pub(crate) async fn run_task(self: Arc<Self>, batch: Batch, reserved_bytes: usize) {
        self.counters.enter();
        let url = self.executor.target_url(&batch).to_string();
        let method = self.executor.config().method().to_string();

        let executor = &self.executor;
        let counters = &self.counters;
        let batch_ref = &batch;
        let result = self
            .retry
            .execute(&url, &method, move |attempt| {
                if attempt > 0 {
                    counters.increment_retried();
                }
                executor.execute(batch_ref, attempt)
            })
            .await;
        self.counters.release_bytes(reserved_bytes);

        match result {
            Ok(response) => {
                self.counters.record_success(batch.len());
                self.counters.exit();
                debug!(batch = batch.sequence(), status = response.status, "task succeeded");
                if let Some(hook) = &self.on_response {
                    hook(&response, &batch);
                }
                self.store(ResponseRecord::Success(self.success_record(response)));
                self.progress.maybe_report(self.counters.progress());
                if !self.request_delay.is_zero() {
                    tokio::time::sleep(self.request_delay).await;
                }
            }
            Err(error) => {
                self.counters.record_failure();
                self.counters.exit();
                warn!(
                    batch = batch.sequence(),
                    records = batch.len(),
                    status = error.status_code(),
                    error = %error,
                    "task failed"
                );
                if let Some(hook) = &self.on_error {
                    hook(&error, &batch);
                } else {
                    self.store(ResponseRecord::Failure(FailureRecord::new(&error, batch)));
                }
                self.progress.maybe_report(self.counters.progress());
            }
        }
    }

    fn success_record(&self, response: HttpResponse) -> SuccessRecord {
        SuccessRecord {
            status: response.status,
            headers: self.include_headers.then_some(response.headers),
            body: response.body,
        }
    }

    fn store(&self, record: ResponseRecord) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Logs the end-of-run counters.
pub(crate) fn log_summary(counters: &RunCounters, duration: Duration) {
    info!(
        requests = counters.requests(),
        rows = counters.rows(),
        errors = counters.errors(),
        retried = counters.retried(),
        peak_in_flight = counters.peak_in_flight(),
        duration_ms = duration.as_millis(),
        "run complete"
    );
}

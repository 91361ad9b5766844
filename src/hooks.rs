//! Caller-supplied hooks.
//!
//! Hooks are injected function values. Transforms are async (through
//! `async_trait` so they stay object-safe); callbacks and the progress sink are
//! synchronous and must not block.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{Batch, Record};
use crate::request::{HttpResponse, RequestError};

/// What a transform decided to do with a record.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Send the record unchanged.
    Keep,
    /// Send this record instead.
    Replace(Record),
}

/// A transform rejected a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransformError {
    message: String,
}

impl TransformError {
    /// Creates a transform error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Reshapes each record before batching.
///
/// Any `Fn(Record) -> Result<TransformOutcome, TransformError>` is a
/// transform.
#[async_trait]
pub trait RecordTransform: Send + Sync {
    /// Transforms one record.
    async fn transform(&self, record: Record) -> Result<TransformOutcome, TransformError>;
}

#[async_trait]
impl<F> RecordTransform for F
where
    F: Fn(Record) -> Result<TransformOutcome, TransformError> + Send + Sync,
{
    async fn transform(&self, record: Record) -> Result<TransformOutcome, TransformError> {
        self(record)
    }
}

/// Called when a transform fails; the untransformed record is still sent.
pub type TransformErrorHandler = Arc<dyn Fn(&TransformError, &Record) + Send + Sync>;

/// Called after each successful task.
pub type ResponseHook = Arc<dyn Fn(&HttpResponse, &Batch) + Send + Sync>;

/// Called for each failed task instead of storing a failure record.
pub type ErrorHook = Arc<dyn Fn(&RequestError, &Batch) + Send + Sync>;

/// Progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressUpdate {
    /// Tasks concluded so far.
    pub completed: u64,
    /// Tasks submitted so far.
    pub total: u64,
    /// Records in concluded tasks.
    pub records: u64,
}

/// Observes run progress. Never affects control flow.
pub trait ProgressSink: Send + Sync {
    /// Receives a snapshot.
    fn report(&self, update: ProgressUpdate);

    /// Called once after the final drain.
    fn finish(&self, _update: ProgressUpdate) {}
}

/// All hooks for one run.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) transform: Option<Arc<dyn RecordTransform>>,
    pub(crate) on_transform_error: Option<TransformErrorHandler>,
    pub(crate) on_response: Option<ResponseHook>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) progress: Option<Arc<dyn ProgressSink>>,
}

impl Hooks {
    /// No hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a record transform.
    #[must_use]
    pub fn transform(mut self, transform: impl RecordTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Installs a transform error handler; without one a transform error aborts the run.
    #[must_use]
    pub fn on_transform_error(
        mut self,
        handler: impl Fn(&TransformError, &Record) + Send + Sync + 'static,
    ) -> Self {
        self.on_transform_error = Some(Arc::new(handler));
        self
    }

    /// Installs a success callback.
    #[must_use]
    pub fn on_response(
        mut self,
        hook: impl Fn(&HttpResponse, &Batch) + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(hook));
        self
    }

    /// Installs a failure callback; failures are then not buffered.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&RequestError, &Batch) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Installs a progress sink.
    #[must_use]
    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("transform", &self.transform.is_some())
            .field("on_transform_error", &self.on_transform_error.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Forwards at most one update per interval to a sink.
pub(crate) struct ProgressThrottle {
    sink: Option<Arc<dyn ProgressSink>>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressThrottle {
    pub(crate) fn new(sink: Option<Arc<dyn ProgressSink>>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last: Mutex::new(None),
        }
    }

    /// Reports `update` unless another report went out within the interval.
    pub(crate) fn maybe_report(&self, update: ProgressUpdate) {
        let Some(sink) = &self.sink else {
            return;
        };
        let now = Instant::now();
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| now.duration_since(at) < self.interval) {
                return;
            }
            *last = Some(now);
        }
        sink.report(update);
    }

    pub(crate) fn finish(&self, update: ProgressUpdate) {
        if let Some(sink) = &self.sink {
            sink.finish(update);
        }
    }
}

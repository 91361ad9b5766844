//! Run orchestrator.
//!
//! [`BulkEngine::run`] wires the pipeline for one invocation:
//!
//! ```text
//! RecordSource -> transform -> Batcher -> DispatchQueue -> HttpExecutor (+ retry) -> ResultSink
//! ```
//!
//! Ingestion pauses whenever the current queue generation has received
//! `max_queued_tasks` tasks; the generation is drained, a fresh one with the
//! same concurrency is installed, and ingestion resumes. Source errors,
//! unhandled transform errors and the memory ceiling stop ingestion; tasks
//! already dispatched still finish before the error is returned.
//!
//! # Example
//!
//! ```no_run
//! use bulkhttp_core::{BulkEngine, RecordSource, RunConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::builder("https://api.example.com/ingest")
//!     .batch_size(50)
//!     .concurrency(8)
//!     .build()?;
//! let engine = BulkEngine::new(config);
//! let records = (0..1000).map(|id| json!({"id": id})).collect::<Vec<_>>();
//! let result = engine.run(RecordSource::Records(records)).await?;
//! println!("{} requests, {} errors", result.req_count, result.errors);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use crate::batch::Batcher;
use crate::buffer::ResultSink;
use crate::config::RunConfig;
use crate::dispatch::{DispatchQueue, ResponseRecord, RunCounters, TaskContext, log_summary};
use crate::error::BulkError;
use crate::hooks::{Hooks, ProgressThrottle, TransformOutcome};
use crate::record::{Batch, Record};
use crate::request::{CookieStore, FormEncoder, HttpExecutor};
use crate::source::{RecordSource, RecordStream};

/// Counters beyond the headline numbers of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Tasks submitted.
    pub batches: u64,
    /// Retry attempts across all tasks.
    pub retried: u64,
    /// Transform errors routed to the handler.
    pub transform_errors: u64,
    /// Queue generations used; more than one means backpressure kicked in.
    pub queue_generations: u64,
    /// Highest number of simultaneously executing tasks.
    pub peak_in_flight: usize,
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Retained outcomes, in completion order.
    pub responses: Vec<ResponseRecord>,
    /// Wall-clock time of the run.
    pub duration: Duration,
    /// Successful tasks.
    pub req_count: u64,
    /// Records in successful tasks.
    pub row_count: u64,
    /// Successful tasks per second.
    pub rps: f64,
    /// Failed tasks.
    pub errors: u64,
    /// Additional counters.
    pub stats: RunStats,
}

/// Results of several targets run together.
#[derive(Debug, Clone)]
pub struct MultiRunResult<T> {
    /// One result per target, in input order.
    pub results: Vec<RunResult>,
    /// Output of the post-processing hook, if one was given.
    pub post_processed: Option<T>,
}

impl<T> MultiRunResult<T> {
    /// All retained outcomes, concatenated in target order.
    #[must_use]
    pub fn responses(&self) -> Vec<&ResponseRecord> {
        self.results
            .iter()
            .flat_map(|result| result.responses.iter())
            .collect()
    }

    /// Failed tasks across all targets.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.results.iter().map(|result| result.errors).sum()
    }
}

/// Runs bulk request jobs for one configuration.
pub struct BulkEngine {
    config: Arc<RunConfig>,
    hooks: Hooks,
    cookie_store: Option<Arc<dyn CookieStore>>,
    form_encoder: Option<Arc<dyn FormEncoder>>,
}

impl BulkEngine {
    /// Creates an engine without hooks.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config: Arc::new(config),
            hooks: Hooks::default(),
            cookie_store: None,
            form_encoder: None,
        }
    }

    /// Installs hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Uses `store` for session cookies instead of a fresh jar.
    #[must_use]
    pub fn with_cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Uses `encoder` for multipart bodies.
    #[must_use]
    pub fn with_form_encoder(mut self, encoder: Arc<dyn FormEncoder>) -> Self {
        self.form_encoder = Some(encoder);
        self
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Sends every record of `source` and returns the run result.
    ///
    /// Per-task failures are counted in [`RunResult::errors`] and never fail
    /// the run.
    ///
    /// # Errors
    ///
    /// - [`BulkError::Validation`] for unusable input, before any request
    /// - [`BulkError::Client`] if the HTTP client cannot be built
    /// - [`BulkError::Source`] when the source fails part-way
    /// - [`BulkError::Transform`] when a transform fails without a handler
    /// - [`BulkError::Memory`] when in-flight payload exceeds the ceiling
    #[instrument(skip(self, source), fields(url = %self.config.url(), method = %self.config.method()))]
    pub async fn run(&self, source: RecordSource) -> Result<RunResult, BulkError> {
        let started = Instant::now();
        let records = source.open(self.config.is_read_only()).await?;
        let executor = self.executor()?;

        let counters = Arc::new(RunCounters::new());
        let sink = ResultSink::new(self.config.store_responses(), self.config.buffer_capacity())?;
        let ctx = Arc::new(TaskContext::new(
            executor,
            Arc::clone(&counters),
            sink,
            self.hooks.on_response.clone(),
            self.hooks.on_error.clone(),
            ProgressThrottle::new(self.hooks.progress.clone(), self.config.progress_interval()),
        ));

        info!(
            batch_size = self.config.batch_size(),
            concurrency = self.config.concurrency(),
            dry_run = self.config.dry_run().is_enabled(),
            "starting run"
        );

        let mut run = RunState::default();
        let outcome = if self.config.is_no_batch() {
            self.ingest_unbatched(records, &ctx, &mut run).await
        } else {
            self.ingest_batched(records, &ctx, &mut run).await
        };

        ctx.progress().finish(counters.progress());
        let responses = ctx.take_responses();
        // Last reference to the executor; the connection pool closes here.
        drop(ctx);

        let duration = started.elapsed();
        log_summary(&counters, duration);
        outcome?;

        let req_count = counters.requests();
        let secs = duration.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let rps = if secs > 0.0 { req_count as f64 / secs } else { 0.0 };
        Ok(RunResult {
            responses,
            duration,
            req_count,
            row_count: counters.rows(),
            rps,
            errors: counters.errors(),
            stats: RunStats {
                batches: counters.submitted(),
                retried: counters.retried(),
                transform_errors: run.transform_errors,
                queue_generations: run.generations,
                peak_in_flight: counters.peak_in_flight(),
            },
        })
    }

    /// Streams records through the batcher with generation-based backpressure.
    async fn ingest_batched(
        &self,
        mut records: RecordStream,
        ctx: &Arc<TaskContext>,
        run: &mut RunState,
    ) -> Result<(), BulkError> {
        let mut batcher = Batcher::new(self.config.batch_size(), self.config.max_queued_tasks());
        let mut queue = DispatchQueue::new(self.config.concurrency());
        run.generations = 1;

        let ingested = async {
            while let Some(item) = records.next().await {
                let record = self.transform(item?, run, ctx).await?;
                if let Some(batch) = batcher.push(record) {
                    self.submit(&mut queue, ctx, batch)?;
                    if batcher.record_submission() {
                        let full = std::mem::replace(
                            &mut queue,
                            DispatchQueue::new(self.config.concurrency()),
                        );
                        full.run().await;
                        run.generations += 1;
                        batcher.resume();
                        debug!(generation = run.generations, "ingestion resumed");
                    }
                }
            }
            if let Some(batch) = batcher.finish() {
                self.submit(&mut queue, ctx, batch)?;
                batcher.record_submission();
            }
            Ok::<(), BulkError>(())
        }
        .await;

        if let Err(error) = &ingested {
            warn!(error = %error, "ingestion stopped, draining in-flight tasks");
        }
        queue.run().await;
        ingested
    }

    /// Sends the whole input as a single task.
    async fn ingest_unbatched(
        &self,
        mut records: RecordStream,
        ctx: &Arc<TaskContext>,
        run: &mut RunState,
    ) -> Result<(), BulkError> {
        run.generations = 1;
        let mut all = Vec::new();
        while let Some(item) = records.next().await {
            all.push(self.transform(item?, run, ctx).await?);
        }
        if all.is_empty() && !self.config.is_read_only() {
            debug!("no records to send");
            return Ok(());
        }

        let mut queue = DispatchQueue::new(1);
        let submitted = self.submit(&mut queue, ctx, Batch::new(0, all));
        queue.run().await;
        submitted
    }

    fn submit(
        &self,
        queue: &mut DispatchQueue,
        ctx: &Arc<TaskContext>,
        batch: Batch,
    ) -> Result<(), BulkError> {
        let bytes = batch.estimated_bytes();
        let counters = ctx.counters();
        let observed = counters.reserve_bytes(bytes);
        if let Some(limit) = self.config.memory_limit()
            && observed > limit
        {
            counters.release_bytes(bytes);
            return Err(BulkError::Memory {
                limit_bytes: limit,
                observed_bytes: observed,
            });
        }

        counters.increment_submitted();
        debug!(batch = batch.sequence(), records = batch.len(), bytes, "dispatching batch");
        queue.add(Arc::clone(ctx).run_task(batch, bytes));
        Ok(())
    }

    async fn transform(
        &self,
        record: Record,
        run: &mut RunState,
        ctx: &TaskContext,
    ) -> Result<Record, BulkError> {
        let index = run.ingested;
        run.ingested += 1;
        let Some(transform) = &self.hooks.transform else {
            return Ok(record);
        };

        match transform.transform(record.clone()).await {
            Ok(TransformOutcome::Keep) => Ok(record),
            Ok(TransformOutcome::Replace(replacement)) => Ok(replacement),
            Err(error) => match &self.hooks.on_transform_error {
                Some(handler) => {
                    handler(&error, &record);
                    run.transform_errors += 1;
                    debug!(record = index, error = %error, "transform error handled");
                    Ok(record)
                }
                None => {
                    warn!(
                        record = index,
                        error = %error,
                        submitted = ctx.counters().submitted(),
                        "transform failed without a handler, aborting run"
                    );
                    Err(BulkError::Transform {
                        record_index: index,
                        message: error.to_string(),
                    })
                }
            },
        }
    }

    fn executor(&self) -> Result<HttpExecutor, BulkError> {
        let mut executor = HttpExecutor::new(Arc::clone(&self.config))?;
        if let Some(store) = &self.cookie_store {
            executor = executor.with_cookie_store(Arc::clone(store));
        }
        if let Some(encoder) = &self.form_encoder {
            executor = executor.with_form_encoder(Arc::clone(encoder));
        }
        Ok(executor)
    }
}

impl std::fmt::Debug for BulkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkEngine")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct RunState {
    ingested: u64,
    transform_errors: u64,
    generations: u64,
}

/// Runs several targets concurrently and optionally post-processes the results.
///
/// # Errors
///
/// Returns the first run-level error; per-task failures never fail the call.
pub async fn run_many<T, P>(
    targets: Vec<(BulkEngine, RecordSource)>,
    post_process: Option<P>,
) -> Result<MultiRunResult<T>, BulkError>
where
    P: FnOnce(&[RunResult]) -> T,
{
    info!(targets = targets.len(), "starting multi-target run");
    let results = try_join_all(
        targets
            .into_iter()
            .map(|(engine, source)| async move { engine.run(source).await }),
    )
    .await?;
    let post_processed = post_process.map(|hook| hook(&results));
    Ok(MultiRunResult {
        results,
        post_processed,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::config::DryRun;
    use crate::hooks::{ProgressSink, ProgressUpdate, TransformError};
    use crate::request::ResponseBody;

    fn dry_config() -> crate::config::RunConfigBuilder {
        RunConfig::builder("http://127.0.0.1:9/in").dry_run(DryRun::Describe)
    }

    fn records(n: usize) -> RecordSource {
        RecordSource::Records((0..n).map(|i| json!({"i": i})).collect())
    }

    fn sent_sizes(result: &RunResult) -> Vec<usize> {
        let mut sizes: Vec<(u64, usize)> = result
            .responses
            .iter()
            .map(|record| match record {
                ResponseRecord::Success(success) => match &success.body {
                    ResponseBody::Json(description) => match &description["body"] {
                        serde_json::Value::Array(items) => {
                            (items[0]["i"].as_u64().unwrap(), items.len())
                        }
                        single => (single["i"].as_u64().unwrap(), 1),
                    },
                    other => panic!("unexpected body {other:?}"),
                },
                ResponseRecord::Failure(failure) => panic!("unexpected failure {failure:?}"),
            })
            .collect();
        sizes.sort_unstable();
        sizes.into_iter().map(|(_, size)| size).collect()
    }

    #[tokio::test]
    async fn test_ten_records_batch_three() {
        let engine = BulkEngine::new(dry_config().batch_size(3).build().unwrap());
        let result = engine.run(records(10)).await.unwrap();
        assert_eq!(result.req_count, 4);
        assert_eq!(result.row_count, 10);
        assert_eq!(result.errors, 0);
        assert_eq!(sent_sizes(&result), vec![3, 3, 3, 1]);
    }

    #[tokio::test]
    async fn test_no_batch_mode_sends_one_task() {
        let engine = BulkEngine::new(dry_config().batch_size(0).build().unwrap());
        let result = engine.run(records(25)).await.unwrap();
        assert_eq!(result.req_count, 1);
        assert_eq!(result.row_count, 25);
        assert_eq!(sent_sizes(&result), vec![25]);
    }

    #[tokio::test]
    async fn test_backpressure_uses_generations() {
        let engine = BulkEngine::new(dry_config().max_queued_tasks(4).build().unwrap());
        let result = engine.run(records(10)).await.unwrap();
        assert_eq!(result.stats.batches, 10);
        // 4 + 4 full generations, then the remaining 2 in a third.
        assert_eq!(result.stats.queue_generations, 3);
        assert_eq!(result.req_count, 10);
    }

    #[tokio::test]
    async fn test_empty_read_only_input_sends_nothing() {
        let engine = BulkEngine::new(dry_config().method("GET").build().unwrap());
        let result = engine.run(RecordSource::Empty).await.unwrap();
        assert_eq!(result.req_count, 0);
        assert!(result.responses.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_for_post_is_rejected() {
        let engine = BulkEngine::new(dry_config().build().unwrap());
        assert!(matches!(
            engine.run(RecordSource::Empty).await.unwrap_err(),
            BulkError::Validation { .. }
        ));
    }

    #[tokio::test]
    async fn test_buffer_keeps_most_recent() {
        let engine = BulkEngine::new(
            dry_config()
                .buffer_capacity(2)
                .concurrency(1)
                .build()
                .unwrap(),
        );
        let result = engine.run(records(3)).await.unwrap();
        assert_eq!(result.req_count, 3);
        assert_eq!(sent_sizes(&result).len(), 2);
        let first = match &result.responses[0] {
            ResponseRecord::Success(success) => match &success.body {
                ResponseBody::Json(description) => description["body"]["i"].clone(),
                _ => unreachable!(),
            },
            ResponseRecord::Failure(_) => unreachable!(),
        };
        assert_eq!(first, json!(1));
    }

    #[tokio::test]
    async fn test_storage_disabled_returns_no_responses() {
        let engine = BulkEngine::new(dry_config().store_responses(false).build().unwrap());
        let result = engine.run(records(5)).await.unwrap();
        assert_eq!(result.req_count, 5);
        assert!(result.responses.is_empty());
    }

    #[tokio::test]
    async fn test_transform_replace_and_keep() {
        let hooks = Hooks::new().transform(
            |record: Record| -> Result<TransformOutcome, TransformError> {
                if record["i"] == 0 {
                    Ok(TransformOutcome::Replace(json!({"i": 0, "tagged": true})))
                } else {
                    Ok(TransformOutcome::Keep)
                }
            },
        );
        let engine = BulkEngine::new(dry_config().concurrency(1).build().unwrap()).with_hooks(hooks);
        let result = engine.run(records(2)).await.unwrap();
        let tagged = result.responses.iter().any(|record| match record {
            ResponseRecord::Success(success) => {
                matches!(&success.body, ResponseBody::Json(d) if d["body"]["tagged"] == true)
            }
            ResponseRecord::Failure(_) => false,
        });
        assert!(tagged);
    }

    #[tokio::test]
    async fn test_transform_error_without_handler_aborts() {
        let hooks = Hooks::new().transform(
            |record: Record| -> Result<TransformOutcome, TransformError> {
                if record["i"] == 3 {
                    Err(TransformError::new("bad record"))
                } else {
                    Ok(TransformOutcome::Keep)
                }
            },
        );
        let engine = BulkEngine::new(dry_config().build().unwrap()).with_hooks(hooks);
        match engine.run(records(10)).await.unwrap_err() {
            BulkError::Transform {
                record_index,
                message,
            } => {
                assert_eq!(record_index, 3);
                assert_eq!(message, "bad record");
            }
            other => panic!("expected transform error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transform_error_with_handler_continues() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hooks = Hooks::new()
            .transform(|_: Record| -> Result<TransformOutcome, TransformError> {
                Err(TransformError::new("nope"))
            })
            .on_transform_error(move |error, record| {
                sink.lock().unwrap().push((error.to_string(), record.clone()));
            });
        let engine = BulkEngine::new(dry_config().build().unwrap()).with_hooks(hooks);
        let result = engine.run(records(3)).await.unwrap();
        assert_eq!(result.req_count, 3);
        assert_eq!(result.stats.transform_errors, 3);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_ceiling_aborts_run() {
        let engine = BulkEngine::new(dry_config().memory_limit(Some(4)).build().unwrap());
        let error = engine.run(records(3)).await.unwrap_err();
        assert!(matches!(error, BulkError::Memory { limit_bytes: 4, .. }));
    }

    #[tokio::test]
    async fn test_source_error_surfaces_after_drain() {
        let stream = futures_util::stream::iter(vec![
            Ok(json!({"i": 0})),
            Err(crate::error::SourceError::Stream {
                message: "upstream closed".into(),
            }),
        ]);
        let engine = BulkEngine::new(dry_config().build().unwrap());
        let error = engine.run(RecordSource::from_stream(stream)).await.unwrap_err();
        assert!(matches!(error, BulkError::Source(_)));
    }

    #[tokio::test]
    async fn test_progress_sink_gets_final_report() {
        #[derive(Default)]
        struct Last(Mutex<Option<ProgressUpdate>>);
        impl ProgressSink for Last {
            fn report(&self, _update: ProgressUpdate) {}
            fn finish(&self, update: ProgressUpdate) {
                *self.0.lock().unwrap() = Some(update);
            }
        }

        let sink = Arc::new(Last::default());
        let engine = BulkEngine::new(dry_config().batch_size(2).build().unwrap())
            .with_hooks(Hooks::new().progress(sink.clone()));
        engine.run(records(5)).await.unwrap();
        assert_eq!(
            *sink.0.lock().unwrap(),
            Some(ProgressUpdate {
                completed: 3,
                total: 3,
                records: 5
            })
        );
    }

    #[tokio::test]
    async fn test_run_many_post_processes() {
        let targets = vec![
            (BulkEngine::new(dry_config().build().unwrap()), records(2)),
            (BulkEngine::new(dry_config().build().unwrap()), records(3)),
        ];
        let multi = run_many(
            targets,
            Some(|results: &[RunResult]| results.iter().map(|r| r.req_count).sum::<u64>()),
        )
        .await
        .unwrap();
        assert_eq!(multi.results.len(), 2);
        assert_eq!(multi.post_processed, Some(5));
        assert_eq!(multi.responses().len(), 5);
        assert_eq!(multi.errors(), 0);
    }
}

//! Bulk HTTP request engine.
//!
//! Streams a large or unbounded sequence of JSON records, groups them into
//! batches, sends the batches concurrently to one endpoint, retries transient
//! failures with backoff, and keeps memory bounded through flow-controlled
//! ingestion and a fixed-capacity result buffer.
//!
//! # Architecture
//!
//! - [`source`] - Normalizes inputs into one lazy record stream
//! - [`batch`] - Batcher and flow controller
//! - [`dispatch`] - Bounded-concurrency dispatch queue and task execution
//! - [`request`] - HTTP executor, request construction, response decoding
//! - [`retry`] - Backoff delays and retry decisions
//! - [`buffer`] - Bounded result buffer
//! - [`engine`] - Run orchestrator
//! - [`config`] - Run configuration and validation
//! - [`hooks`] - Transforms, callbacks and progress reporting
//! - [`output`] - JSON / NDJSON / CSV result writers

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod output;
pub mod record;
pub mod request;
pub mod retry;
pub mod source;
mod user_agent;

// Re-export commonly used types
pub use batch::{Batcher, FlowState};
pub use buffer::{BufferError, ResultSink, RingBuffer};
pub use config::{BodyFormat, DryRun, RunConfig, RunConfigBuilder};
pub use dispatch::{DispatchQueue, FailureRecord, ResponseRecord, RunCounters, SuccessRecord};
pub use engine::{BulkEngine, MultiRunResult, RunResult, RunStats, run_many};
pub use error::{BulkError, SourceError};
pub use hooks::{
    ErrorHook, Hooks, ProgressSink, ProgressUpdate, RecordTransform, ResponseHook,
    TransformError, TransformErrorHandler, TransformOutcome,
};
pub use output::{OutputFormat, write_responses};
pub use record::{Batch, Record};
pub use request::{
    CookieStore, FormEncoder, HttpExecutor, HttpResponse, JarCookieStore, MultipartFormEncoder,
    RequestError, ResponseBody,
};
pub use retry::{RetryConfig, RetryDecision, RetryStrategy};
pub use source::RecordSource;

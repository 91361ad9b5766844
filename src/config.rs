//! Run configuration.
//!
//! A [`RunConfig`] is assembled once per invocation through
//! [`RunConfigBuilder`], validated in [`RunConfigBuilder::build`], and never
//! mutated afterwards.
//!
//! # Example
//!
//! ```
//! use bulkhttp_core::config::RunConfig;
//!
//! let config = RunConfig::builder("https://api.example.com/ingest")
//!     .batch_size(100)
//!     .concurrency(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.batch_size(), 100);
//! ```

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;
use url::Url;

use crate::error::BulkError;
use crate::retry::{RetryConfig, RetryPredicate};

/// Default records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default number of tasks handed to one queue generation before a drain.
pub const DEFAULT_MAX_QUEUED_TASKS: usize = 1000;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Smallest accepted per-request timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of outcomes retained in the result buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Default minimum spacing between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// How the request body is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyFormat {
    /// `application/json`.
    #[default]
    Json,
    /// `application/x-www-form-urlencoded`.
    Form,
    /// `multipart/form-data`, produced by the configured form encoder.
    Multipart,
}

/// Whether requests are actually sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DryRun {
    /// Send requests.
    #[default]
    Off,
    /// Record a JSON description of each request instead of sending it.
    Describe,
    /// Record an equivalent `curl` command instead of sending it.
    Curl,
}

impl DryRun {
    /// Returns true unless requests are sent for real.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }
}

/// Immutable, fully defaulted configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    url: Url,
    method: Method,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body_format: BodyFormat,
    batch_size: usize,
    concurrency: usize,
    max_queued_tasks: usize,
    timeout: Duration,
    retry: RetryConfig,
    store_responses: bool,
    buffer_capacity: usize,
    include_response_headers: bool,
    memory_limit: Option<usize>,
    pooling: bool,
    cookies: bool,
    dry_run: DryRun,
    request_delay: Duration,
    progress_interval: Duration,
}

impl RunConfig {
    /// Starts a builder targeting `url`.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> RunConfigBuilder {
        RunConfigBuilder::new(url)
    }

    /// Target URL, without configured query parameters.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns true for methods that carry no body (GET, HEAD, DELETE, OPTIONS).
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        is_read_only_method(&self.method)
    }

    /// Extra request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Query parameters appended to every request.
    #[must_use]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Body encoding.
    #[must_use]
    pub fn body_format(&self) -> BodyFormat {
        self.body_format
    }

    /// Records per batch; zero sends the whole input as one request.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns true when batching and backpressure are bypassed.
    #[must_use]
    pub fn is_no_batch(&self) -> bool {
        self.batch_size == 0
    }

    /// Maximum simultaneously executing tasks.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks handed to one queue generation before ingestion pauses for a drain.
    #[must_use]
    pub fn max_queued_tasks(&self) -> usize {
        self.max_queued_tasks
    }

    /// Per-attempt deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retry parameters.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Whether concluded outcomes are kept in the result buffer.
    #[must_use]
    pub fn store_responses(&self) -> bool {
        self.store_responses
    }

    /// Result buffer capacity.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Whether success records carry response headers.
    #[must_use]
    pub fn include_response_headers(&self) -> bool {
        self.include_response_headers
    }

    /// Ceiling for estimated in-flight payload bytes.
    #[must_use]
    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    /// Whether idle keep-alive connections are reused.
    #[must_use]
    pub fn pooling(&self) -> bool {
        self.pooling
    }

    /// Whether session cookies are sent and collected.
    #[must_use]
    pub fn cookies(&self) -> bool {
        self.cookies
    }

    /// Dry-run mode.
    #[must_use]
    pub fn dry_run(&self) -> DryRun {
        self.dry_run
    }

    /// Pause applied by a task after each successful request.
    #[must_use]
    pub fn request_delay(&self) -> Duration {
        self.request_delay
    }

    /// Minimum spacing between progress reports.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }
}

/// Returns true for methods that never carry a request body.
#[must_use]
pub fn is_read_only_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
    )
}

/// Fluent builder for [`RunConfig`].
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body_format: BodyFormat,
    batch_size: usize,
    concurrency: usize,
    max_queued_tasks: usize,
    timeout: Duration,
    retry: RetryConfig,
    store_responses: bool,
    buffer_capacity: usize,
    include_response_headers: bool,
    memory_limit: Option<usize>,
    pooling: bool,
    cookies: bool,
    dry_run: DryRun,
    request_delay: Duration,
    progress_interval: Duration,
}

impl RunConfigBuilder {
    /// Starts from defaults targeting `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::POST.to_string(),
            headers: Vec::new(),
            query: Vec::new(),
            body_format: BodyFormat::Json,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_queued_tasks: DEFAULT_MAX_QUEUED_TASKS,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
            store_responses: true,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            include_response_headers: false,
            memory_limit: None,
            pooling: true,
            cookies: false,
            dry_run: DryRun::Off,
            request_delay: Duration::ZERO,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// HTTP method name, case-insensitive.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Body encoding.
    #[must_use]
    pub fn body_format(mut self, format: BodyFormat) -> Self {
        self.body_format = format;
        self
    }

    /// Records per batch; zero disables batching.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Maximum simultaneously executing tasks.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Backpressure threshold.
    #[must_use]
    pub fn max_queued_tasks(mut self, max_queued_tasks: usize) -> Self {
        self.max_queued_tasks = max_queued_tasks;
        self
    }

    /// Per-attempt deadline; must be at least [`MIN_TIMEOUT`].
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces all retry parameters.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Retries after the first attempt.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Base (or static) retry delay.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.base_delay = delay;
        self
    }

    /// Upper bound for retry delays.
    #[must_use]
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.max_delay = delay;
        self
    }

    /// Use a fixed retry delay instead of exponential backoff.
    #[must_use]
    pub fn static_retry_delay(mut self, enabled: bool) -> Self {
        self.retry.static_delay = enabled;
        self
    }

    /// Replaces the retryable status set.
    #[must_use]
    pub fn retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retry.retryable_statuses = statuses.into_iter().collect::<BTreeSet<_>>();
        self
    }

    /// Installs a retry predicate that overrides built-in classification.
    #[must_use]
    pub fn retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retry.predicate = Some(predicate);
        self
    }

    /// Whether outcomes are stored in the result buffer.
    #[must_use]
    pub fn store_responses(mut self, store: bool) -> Self {
        self.store_responses = store;
        self
    }

    /// Result buffer capacity.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Whether success records carry response headers.
    #[must_use]
    pub fn include_response_headers(mut self, include: bool) -> Self {
        self.include_response_headers = include;
        self
    }

    /// Ceiling for estimated in-flight payload bytes.
    #[must_use]
    pub fn memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Whether idle keep-alive connections are reused.
    #[must_use]
    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }

    /// Whether session cookies are sent and collected.
    #[must_use]
    pub fn cookies(mut self, enabled: bool) -> Self {
        self.cookies = enabled;
        self
    }

    /// Dry-run mode.
    #[must_use]
    pub fn dry_run(mut self, mode: DryRun) -> Self {
        self.dry_run = mode;
        self
    }

    /// Pause applied by a task after each successful request.
    #[must_use]
    pub fn request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Minimum spacing between progress reports.
    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// No retries and no stored responses, for throughput-only workloads.
    #[must_use]
    pub fn fire_and_forget(mut self) -> Self {
        self.retry.max_retries = 0;
        self.store_responses = false;
        self
    }

    /// Validates every option and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Configuration`] naming the first invalid option.
    pub fn build(self) -> Result<RunConfig, BulkError> {
        let url = Url::parse(&self.url)
            .map_err(|error| BulkError::configuration("url", format!("{}: {error}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BulkError::configuration(
                "url",
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }

        let method = Method::from_str(&self.method.to_ascii_uppercase())
            .map_err(|_| BulkError::configuration("method", format!("`{}` is not a valid method", self.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| BulkError::configuration("headers", format!("invalid header name `{name}`")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|_| BulkError::configuration("headers", format!("invalid value for header `{name}`")))?;
            headers.append(name, value);
        }

        if self.concurrency == 0 {
            return Err(BulkError::configuration("concurrency", "must be at least 1"));
        }
        if self.max_queued_tasks == 0 {
            return Err(BulkError::configuration("max_queued_tasks", "must be at least 1"));
        }
        if self.timeout < MIN_TIMEOUT {
            return Err(BulkError::configuration(
                "timeout",
                format!(
                    "{}ms is below the minimum of {}ms",
                    self.timeout.as_millis(),
                    MIN_TIMEOUT.as_millis()
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(BulkError::configuration("jitter_factor", "must be between 0 and 1"));
        }
        if !self.retry.exponential_base.is_finite() || self.retry.exponential_base < 1.0 {
            return Err(BulkError::configuration("exponential_base", "must be at least 1"));
        }
        if self.retry.max_delay < self.retry.base_delay && !self.retry.static_delay {
            return Err(BulkError::configuration(
                "max_retry_delay",
                "must not be smaller than the base retry delay",
            ));
        }
        if self.store_responses && self.buffer_capacity == 0 {
            return Err(BulkError::configuration(
                "buffer_capacity",
                "must be at least 1 when responses are stored",
            ));
        }
        if self.memory_limit == Some(0) {
            return Err(BulkError::configuration("memory_limit", "must be positive"));
        }

        debug!(
            url = %url,
            method = %method,
            batch_size = self.batch_size,
            concurrency = self.concurrency,
            max_queued_tasks = self.max_queued_tasks,
            max_retries = self.retry.max_retries,
            "run configuration built"
        );

        Ok(RunConfig {
            url,
            method,
            headers,
            query: self.query,
            body_format: self.body_format,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            max_queued_tasks: self.max_queued_tasks,
            timeout: self.timeout,
            retry: self.retry,
            store_responses: self.store_responses,
            buffer_capacity: self.buffer_capacity,
            include_response_headers: self.include_response_headers,
            memory_limit: self.memory_limit,
            pooling: self.pooling,
            cookies: self.cookies,
            dry_run: self.dry_run,
            request_delay: self.request_delay,
            progress_interval: self.progress_interval,
        })
    }
}

//! Retry logic with exponential backoff for transient request failures.
//!
//! This module provides [`RetryStrategy`], a stateless decision function over
//! `(attempt, error, config)`, and the retry loop that wraps each task's
//! network call.
//!
//! # Overview
//!
//! When an attempt fails, the strategy decides:
//! - whether the error is retryable (custom predicate first, then network
//!   errors, timeouts and the configured status set)
//! - whether attempts remain (`attempt < max_retries`)
//! - how long to wait (static delay, server `Retry-After`, or exponential
//!   backoff with jitter, always capped at `max_delay`)
//!
//! A non-retryable failure propagates unchanged. A retryable failure on the
//! final attempt is wrapped in [`RequestError::RetriesExhausted`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bulkhttp_core::retry::{RetryConfig, RetryDecision, RetryStrategy};
//! use bulkhttp_core::request::RequestError;
//!
//! let strategy = RetryStrategy::new(RetryConfig::default());
//! let error = RequestError::http("https://example.com/ingest", "POST", 503, "");
//!
//! match strategy.decide(&error, 0) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, instrument};

use crate::request::RequestError;

/// Default maximum retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (30 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default backoff multiplier (doubles each attempt).
pub const DEFAULT_EXPONENTIAL_BASE: f64 = 2.0;

/// Default jitter, as a fraction of the computed backoff.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Status codes retried unless configured otherwise.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Caller-supplied retry rule. Receives the error and the zero-based attempt
/// that produced it; overrides every built-in classification rule.
pub type RetryPredicate = Arc<dyn Fn(&RequestError, u32) -> bool + Send + Sync>;

/// Retry parameters.
///
/// # Delay Calculation
///
/// ```text
/// static mode:       delay = base_delay
/// with Retry-After:  delay = min(retry_after, max_delay)
/// otherwise:         delay = min(b + rand(0..=b * jitter_factor), max_delay)
///                    where b = base_delay * exponential_base^attempt
/// ```
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Base delay, or the fixed delay in static mode.
    pub base_delay: Duration,
    /// Upper bound for every computed delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub exponential_base: f64,
    /// Fraction of the backoff added as uniform random jitter.
    pub jitter_factor: f64,
    /// Use `base_delay` for every retry instead of exponential backoff.
    pub static_delay: bool,
    /// HTTP statuses treated as transient.
    pub retryable_statuses: BTreeSet<u16>,
    /// Optional override for retryability.
    pub predicate: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            exponential_base: DEFAULT_EXPONENTIAL_BASE,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            static_delay: false,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
            predicate: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_base", &self.exponential_base)
            .field("jitter_factor", &self.jitter_factor)
            .field("static_delay", &self.static_delay)
            .field("retryable_statuses", &self.retryable_statuses)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Zero-based index of the next attempt.
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Stateless retry policy applied to every task of a run.
#[derive(Debug, Clone, Default)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    /// Creates a strategy from the given parameters.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the configured parameters.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns the maximum number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Calculates the wait before retrying after `attempt` failed.
    ///
    /// The result never exceeds `max_delay`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32, error: Option<&RequestError>) -> Duration {
        if self.config.static_delay {
            return self.config.base_delay;
        }
        if let Some(retry_after) = error.and_then(RequestError::retry_after) {
            return retry_after.min(self.config.max_delay);
        }

        let backoff_ms = self.backoff_ms(attempt);
        let jitter_ms = self.jitter_ms(backoff_ms);
        let capped_ms = (backoff_ms + jitter_ms).min(self.max_delay_ms());

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped_ms as u64)
    }

    /// Returns true when `error` on zero-based `attempt` warrants another attempt.
    #[must_use]
    pub fn should_retry(&self, error: &RequestError, attempt: u32) -> bool {
        attempt < self.config.max_retries && self.is_retryable(error, attempt)
    }

    /// Determines whether and when to retry after `attempt` failed with `error`.
    #[instrument(skip(self, error), fields(max_retries = self.config.max_retries))]
    pub fn decide(&self, error: &RequestError, attempt: u32) -> RetryDecision {
        if !self.is_retryable(error, attempt) {
            return RetryDecision::DoNotRetry {
                reason: "non-retryable failure".to_string(),
            };
        }
        if attempt >= self.config.max_retries {
            debug!(attempt, max = self.config.max_retries, "max retries reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.config.max_retries),
            };
        }

        let delay = self.calculate_delay(attempt, Some(error));
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or retries run out.
    ///
    /// `operation` receives the zero-based attempt index. A non-retryable
    /// error is returned unchanged; a retryable error on the final attempt is
    /// wrapped in [`RequestError::RetriesExhausted`] carrying `url`, `method`
    /// and the retry count.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error, wrapped when retries were exhausted.
    pub async fn execute<T, F, Fut>(
        &self,
        url: &str,
        method: &str,
        mut operation: F,
    ) -> Result<T, RequestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut attempt = 0u32;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.is_retryable(&error, attempt) {
                debug!(attempt, %error, "not retrying request");
                return Err(error);
            }
            if attempt >= self.config.max_retries {
                return Err(RequestError::RetriesExhausted {
                    url: url.to_string(),
                    method: method.to_string(),
                    retries: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.calculate_delay(attempt, Some(&error));
            info!(
                url,
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis(),
                using_retry_after = error.retry_after().is_some(),
                error = %error,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Retryability ignoring the attempt budget.
    fn is_retryable(&self, error: &RequestError, attempt: u32) -> bool {
        if let Some(predicate) = &self.config.predicate {
            return predicate(error, attempt);
        }
        if error.is_network() || error.is_timeout() {
            return true;
        }
        error
            .status_code()
            .is_some_and(|status| self.config.retryable_statuses.contains(&status))
    }

    /// `base_delay * exponential_base^attempt` in milliseconds, without jitter or cap.
    fn backoff_ms(&self, attempt: u32) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let base_ms = self.config.base_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        base_ms * self.config.exponential_base.powi(exponent)
    }

    #[allow(clippy::cast_precision_loss)]
    fn max_delay_ms(&self) -> f64 {
        self.config.max_delay.as_millis() as f64
    }

    /// Uniform random jitter in `0..=backoff * jitter_factor`.
    ///
    /// Jitter helps prevent thundering herd when many batches fail at once.
    fn jitter_ms(&self, backoff_ms: f64) -> f64 {
        let span = (backoff_ms * self.config.jitter_factor).min(self.max_delay_ms());
        if span.is_finite() && span > 0.0 {
            rand::thread_rng().gen_range(0.0..=span)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn no_jitter(max_retries: u32) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter_factor: 0.0,
            ..RetryConfig::default()
        })
    }

    fn fast(max_retries: u32) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            ..RetryConfig::default()
        })
    }

    fn server_error() -> RequestError {
        RequestError::http("https://x.test/in", "POST", 500, "boom")
    }

    // ==================== Config Tests ====================

    #[test]
    fn test_retry_config_default_values() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.exponential_base - 2.0).abs() < f64::EPSILON);
        assert!(config.retryable_statuses.contains(&429));
        assert!(!config.retryable_statuses.contains(&404));
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_doubles_without_jitter() {
        let strategy = no_jitter(5);
        assert_eq!(strategy.calculate_delay(0, None), Duration::from_millis(100));
        assert_eq!(strategy.calculate_delay(1, None), Duration::from_millis(200));
        assert_eq!(strategy.calculate_delay(2, None), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_monotonic_and_capped() {
        let strategy = no_jitter(50);
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = strategy.calculate_delay(attempt, None);
            assert!(delay >= previous, "delay decreased at attempt {attempt}");
            assert!(delay <= Duration::from_millis(1_000));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let strategy = RetryStrategy::new(RetryConfig {
            base_delay: Duration::from_millis(1_000),
            jitter_factor: 0.5,
            ..RetryConfig::default()
        });
        for _ in 0..100 {
            let delay = strategy.calculate_delay(0, None);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let strategy = RetryStrategy::new(RetryConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            jitter_factor: 1.0,
            ..RetryConfig::default()
        });
        for attempt in 0..10 {
            assert!(strategy.calculate_delay(attempt, None) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_static_delay_ignores_attempt_and_retry_after() {
        let strategy = RetryStrategy::new(RetryConfig {
            base_delay: Duration::from_millis(250),
            static_delay: true,
            ..RetryConfig::default()
        });
        let error = RequestError::rate_limited("https://x.test", "POST", Some(Duration::from_secs(9)));
        assert_eq!(strategy.calculate_delay(0, None), Duration::from_millis(250));
        assert_eq!(strategy.calculate_delay(7, Some(&error)), Duration::from_millis(250));
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let strategy = RetryStrategy::default();
        let error = RequestError::rate_limited("https://x.test", "POST", Some(Duration::from_secs(5)));
        assert_eq!(strategy.calculate_delay(3, Some(&error)), Duration::from_millis(5_000));
    }

    #[test]
    fn test_retry_after_capped_at_max_delay() {
        let strategy = no_jitter(3);
        let error = RequestError::rate_limited("https://x.test", "POST", Some(Duration::from_secs(60)));
        assert_eq!(strategy.calculate_delay(0, Some(&error)), Duration::from_millis(1_000));
    }

    // ==================== Should Retry Tests ====================

    #[test]
    fn test_should_retry_false_once_attempts_exhausted() {
        let strategy = no_jitter(2);
        let errors = [
            server_error(),
            RequestError::timeout("https://x.test", "POST", Duration::from_secs(1)),
            RequestError::rate_limited("https://x.test", "POST", None),
        ];
        for error in &errors {
            assert!(strategy.should_retry(error, 0));
            assert!(strategy.should_retry(error, 1));
            assert!(!strategy.should_retry(error, 2));
            assert!(!strategy.should_retry(error, 10));
        }
    }

    #[test]
    fn test_should_retry_status_classification() {
        let strategy = no_jitter(3);
        assert!(strategy.should_retry(&RequestError::http("u", "POST", 503, ""), 0));
        assert!(!strategy.should_retry(&RequestError::http("u", "POST", 404, ""), 0));
        assert!(!strategy.should_retry(&RequestError::http("u", "POST", 400, ""), 0));
        assert!(!strategy.should_retry(&RequestError::invalid_request("u", "bad"), 0));
    }

    #[test]
    fn test_custom_predicate_takes_precedence() {
        let strategy = RetryStrategy::new(RetryConfig {
            max_retries: 3,
            predicate: Some(Arc::new(|error: &RequestError, _attempt| {
                error.status_code() == Some(404)
            })),
            ..RetryConfig::default()
        });
        assert!(strategy.should_retry(&RequestError::http("u", "GET", 404, ""), 0));
        assert!(!strategy.should_retry(&RequestError::http("u", "GET", 503, ""), 0));
        assert!(!strategy.should_retry(&RequestError::http("u", "GET", 404, ""), 3));
    }

    #[test]
    fn test_decide_rate_limit_uses_retry_after_exactly() {
        let strategy = RetryStrategy::default();
        let error = RequestError::rate_limited("https://x.test", "POST", Some(Duration::from_secs(5)));
        assert_eq!(
            strategy.decide(&error, 0),
            RetryDecision::Retry {
                delay: Duration::from_millis(5_000),
                attempt: 1
            }
        );
    }

    #[test]
    fn test_decide_reasons() {
        let strategy = no_jitter(1);
        let permanent = strategy.decide(&RequestError::http("u", "POST", 404, ""), 0);
        assert!(matches!(permanent, RetryDecision::DoNotRetry { reason } if reason.contains("non-retryable")));
        let exhausted = strategy.decide(&server_error(), 1);
        assert!(matches!(exhausted, RetryDecision::DoNotRetry { reason } if reason.contains("exhausted")));
    }

    // ==================== Execute Tests ====================

    #[tokio::test]
    async fn test_execute_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .execute("https://x.test", "POST", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, RequestError>(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_recovers_after_transient_failures() {
        let result = fast(3)
            .execute("https://x.test", "POST", |attempt| async move {
                if attempt < 2 { Err(server_error()) } else { Ok(attempt) }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_execute_wraps_exhausted_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(2)
            .execute("https://x.test/in", "POST", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(server_error()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            RequestError::RetriesExhausted {
                retries,
                last,
                url,
                method,
            } => {
                assert_eq!(retries, 2);
                assert_eq!(last.status_code(), Some(500));
                assert_eq!(url, "https://x.test/in");
                assert_eq!(method, "POST");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_propagates_non_retryable_unwrapped() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .execute("https://x.test", "POST", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RequestError::http("https://x.test", "POST", 422, "invalid")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            RequestError::Http { status: 422, .. }
        ));
    }

    #[tokio::test]
    async fn test_execute_zero_retries_single_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(0)
            .execute("https://x.test", "POST", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(server_error()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_retries_exhausted());
    }
}

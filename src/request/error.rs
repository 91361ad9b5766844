//! Error types for individual request attempts.
//!
//! Each variant carries the URL and method of the failed attempt so a
//! failure record can be produced without extra context.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use thiserror::Error;

use super::response::{HeaderList, RateLimitQuota};

/// Errors produced by one attempt, or by a retry loop that gave up.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Non-2xx response other than 429.
    #[error("HTTP {status} from {method} {url}")]
    Http {
        /// Request URL.
        url: String,
        /// Request method.
        method: String,
        /// Response status code.
        status: u16,
        /// Decoded response body text.
        body: String,
        /// Response headers.
        headers: HeaderList,
    },

    /// HTTP 429 Too Many Requests.
    #[error("rate limited (HTTP 429) by {method} {url}")]
    RateLimited {
        /// Request URL.
        url: String,
        /// Request method.
        method: String,
        /// Server-specified wait from `Retry-After`, if present and parseable.
        retry_after: Option<Duration>,
        /// Quota headers sent with the response.
        quota: RateLimitQuota,
        /// Decoded response body text.
        body: String,
        /// Response headers.
        headers: HeaderList,
    },

    /// DNS resolution or connection failure.
    #[error("network error sending {method} {url}: {source}")]
    Network {
        /// Request URL.
        url: String,
        /// Request method.
        method: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The attempt exceeded its deadline and was aborted.
    #[error("timeout after {}ms sending {method} {url}", timeout.as_millis())]
    Timeout {
        /// Request URL.
        url: String,
        /// Request method.
        method: String,
        /// The per-request deadline that elapsed.
        timeout: Duration,
    },

    /// Certificate validation or TLS handshake failure.
    #[error("TLS error sending {method} {url}: {source}")]
    Tls {
        /// Request URL.
        url: String,
        /// Request method.
        method: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Every permitted attempt failed.
    #[error("{method} {url} failed after {retries} retries: {last}")]
    RetriesExhausted {
        /// Request URL.
        url: String,
        /// Request method.
        method: String,
        /// Number of retries performed after the first attempt.
        retries: u32,
        /// The error of the final attempt.
        #[source]
        last: Box<RequestError>,
    },

    /// The request could not be constructed.
    #[error("cannot build request for {url}: {message}")]
    InvalidRequest {
        /// Target URL.
        url: String,
        /// What went wrong.
        message: String,
    },
}

impl RequestError {
    /// Creates a non-2xx status error.
    pub fn http(
        url: impl Into<String>,
        method: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        Self::Http {
            url: url.into(),
            method: method.into(),
            status,
            body: body.into(),
            headers: HeaderList::new(),
        }
    }

    /// Creates a 429 error with an optional server-specified wait.
    pub fn rate_limited(
        url: impl Into<String>,
        method: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::RateLimited {
            url: url.into(),
            method: method.into(),
            retry_after,
            quota: RateLimitQuota::default(),
            body: String::new(),
            headers: HeaderList::new(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>, method: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            url: url.into(),
            method: method.into(),
            timeout,
        }
    }

    /// Creates a request construction error.
    pub fn invalid_request(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Classifies a client error raised while sending.
    ///
    /// Timeouts map to [`RequestError::Timeout`]; certificate and handshake
    /// failures to [`RequestError::Tls`]; everything else to
    /// [`RequestError::Network`].
    pub fn from_send(
        url: impl Into<String>,
        method: impl Into<String>,
        timeout: Duration,
        source: reqwest::Error,
    ) -> Self {
        let url = url.into();
        let method = method.into();
        if source.is_timeout() {
            Self::Timeout {
                url,
                method,
                timeout,
            }
        } else if is_tls_error(&source) {
            Self::Tls {
                url,
                method,
                source,
            }
        } else {
            Self::Network {
                url,
                method,
                source,
            }
        }
    }

    /// HTTP status code, when the failure came from a response.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::RetriesExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    /// Server-specified retry delay carried by a 429 response.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Response body text, when the failure came from a response.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Http { body, .. } | Self::RateLimited { body, .. } => Some(body),
            Self::RetriesExhausted { last, .. } => last.body(),
            _ => None,
        }
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Http { url, .. }
            | Self::RateLimited { url, .. }
            | Self::Network { url, .. }
            | Self::Timeout { url, .. }
            | Self::Tls { url, .. }
            | Self::RetriesExhausted { url, .. }
            | Self::InvalidRequest { url, .. } => url,
        }
    }

    /// Request method, when known.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Http { method, .. }
            | Self::RateLimited { method, .. }
            | Self::Network { method, .. }
            | Self::Timeout { method, .. }
            | Self::Tls { method, .. }
            | Self::RetriesExhausted { method, .. } => Some(method),
            Self::InvalidRequest { .. } => None,
        }
    }

    /// Returns true for DNS and connection failures.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Returns true when the attempt hit its deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for the wrapper produced when retries run out.
    #[must_use]
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
///
/// The top-level message embeds the request URL, so only the causes are
/// inspected.
fn is_tls_error(error: &reqwest::Error) -> bool {
    cause_chain_is_tls(error.source(), error.is_connect())
}

const TLS_MARKERS: [&str; 4] = ["certificate", "tls", "ssl", "handshake"];

fn cause_chain_is_tls(mut current: Option<&(dyn StdError + 'static)>, connecting: bool) -> bool {
    while let Some(err) = current {
        // TLS connectors surface handshake failures as `InvalidData` I/O errors.
        if connecting
            && err
                .downcast_ref::<io::Error>()
                .is_some_and(|io_error| io_error.kind() == io::ErrorKind::InvalidData)
        {
            return true;
        }
        let text = err.to_string().to_ascii_lowercase();
        if TLS_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = err.source();
    }
    false
}

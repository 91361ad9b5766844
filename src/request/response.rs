//! Response decoding and rate-limit header parsing.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Response headers flattened to lowercase names; repeated headers are joined with `", "`.
pub type HeaderList = BTreeMap<String, String>;

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// `application/json` body that parsed successfully.
    Json(Value),
    /// `text/*` body, or JSON that failed to parse.
    Text(String),
    /// Any other content type.
    Bytes(#[serde(serialize_with = "serialize_lossy")] Vec<u8>),
}

impl ResponseBody {
    /// Decodes raw bytes according to the response `Content-Type`.
    ///
    /// `application/json` (and `+json` suffixes) parse to a value, falling back
    /// to text when parsing fails; `text/*` becomes text; everything else is
    /// kept as bytes. A missing content type with an empty body decodes to
    /// empty text.
    #[must_use]
    pub fn decode(content_type: Option<&str>, bytes: Vec<u8>) -> Self {
        let mime = content_type
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if mime == "application/json" || mime.ends_with("+json") {
            return match serde_json::from_slice(&bytes) {
                Ok(value) => Self::Json(value),
                Err(error) => {
                    debug!(%error, "JSON response failed to parse, keeping raw text");
                    Self::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
            };
        }
        if mime.starts_with("text/") || (mime.is_empty() && bytes.is_empty()) {
            return Self::Text(String::from_utf8_lossy(&bytes).into_owned());
        }
        Self::Bytes(bytes)
    }

    /// Text rendering used in error messages and failure records.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Text(text) => text.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// Quota headers advertised alongside a 429 response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitQuota {
    /// Requests allowed per window (`X-RateLimit-Limit`).
    pub limit: Option<u64>,
    /// Requests left in the current window (`X-RateLimit-Remaining`).
    pub remaining: Option<u64>,
    /// Seconds or epoch timestamp when the window resets (`X-RateLimit-Reset`).
    pub reset: Option<u64>,
}

impl RateLimitQuota {
    /// Reads `X-RateLimit-*` headers, falling back to the draft `RateLimit-*` names.
    #[must_use]
    pub fn from_headers(headers: &HeaderList) -> Self {
        let read = |suffix: &str| {
            headers
                .get(&format!("x-ratelimit-{suffix}"))
                .or_else(|| headers.get(&format!("ratelimit-{suffix}")))
                .and_then(|value| value.trim().parse::<u64>().ok())
        };
        Self {
            limit: read("limit"),
            remaining: read("remaining"),
            reset: read("reset"),
        }
    }
}

/// Flattens a header map into lowercase name/value pairs.
#[must_use]
pub fn header_list(headers: &HeaderMap) -> HeaderList {
    let mut list = HeaderList::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        list.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    list
}

/// Extracts the `Content-Type` header value.
#[must_use]
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bulkhttp_core::request::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => {
            warn!(
                delay_secs = duration.as_secs(),
                max_secs = MAX_RETRY_AFTER.as_secs(),
                "Retry-After date exceeds maximum, capping at 1 hour"
            );
            Some(MAX_RETRY_AFTER)
        }
        Ok(duration) => Some(duration),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    }
}

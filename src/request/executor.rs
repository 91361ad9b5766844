//! HTTP executor: one request per batch attempt.
//!
//! The executor owns the connection pool for a run. It builds the request,
//! enforces the per-attempt deadline, decodes the body and turns every
//! non-success outcome into a classified [`RequestError`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER, SET_COOKIE};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use url::Url;

use super::cookies::{CookieStore, JarCookieStore};
use super::error::RequestError;
use super::form::{FormEncoder, MultipartFormEncoder};
use super::prepare::{self, PreparedRequest};
use super::response::{
    HeaderList, RateLimitQuota, ResponseBody, content_type, header_list, parse_retry_after,
};
use crate::config::{DryRun, RunConfig};
use crate::error::BulkError;
use crate::record::Batch;
use crate::user_agent;

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 10;

/// A decoded successful response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    /// HTTP status; `0` for dry runs.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderList,
    /// Decoded body.
    pub body: ResponseBody,
}

/// Sends batches to the configured target.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    config: Arc<RunConfig>,
    cookies: Option<Arc<dyn CookieStore>>,
    form_encoder: Arc<dyn FormEncoder>,
}

impl HttpExecutor {
    /// Builds the client and default collaborators for `config`.
    ///
    /// When cookies are enabled a fresh [`JarCookieStore`] is installed.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Client`] if the HTTP client cannot be built.
    #[instrument(level = "debug", skip(config), fields(pooling = config.pooling()))]
    pub fn new(config: Arc<RunConfig>) -> Result<Self, BulkError> {
        let client = build_client(&config).map_err(BulkError::Client)?;
        let cookies: Option<Arc<dyn CookieStore>> = if config.cookies() {
            Some(Arc::new(JarCookieStore::new()))
        } else {
            None
        };
        Ok(Self {
            client,
            config,
            cookies,
            form_encoder: Arc::new(MultipartFormEncoder::new()),
        })
    }

    /// Replaces the cookie store; has no effect unless cookies are enabled.
    #[must_use]
    pub fn with_cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        if self.config.cookies() {
            self.cookies = Some(store);
        }
        self
    }

    /// Replaces the multipart form encoder.
    #[must_use]
    pub fn with_form_encoder(mut self, encoder: Arc<dyn FormEncoder>) -> Self {
        self.form_encoder = encoder;
        self
    }

    /// The cookie store in use, if cookies are enabled.
    #[must_use]
    pub fn cookie_store(&self) -> Option<&Arc<dyn CookieStore>> {
        self.cookies.as_ref()
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Builds the request for `batch` without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidRequest`] if the body cannot be encoded.
    pub fn prepare(&self, batch: &Batch) -> Result<PreparedRequest, RequestError> {
        PreparedRequest::build(
            &self.config,
            batch,
            self.cookies.as_deref(),
            self.form_encoder.as_ref(),
        )
    }

    /// URL that `batch` is sent to, including its query string.
    #[must_use]
    pub fn target_url(&self, batch: &Batch) -> Url {
        prepare::target_url(&self.config, batch)
    }

    /// Executes one attempt for `batch`.
    ///
    /// Dry runs return status `0` with the request description (or curl
    /// command) as the body and perform no I/O.
    ///
    /// # Errors
    ///
    /// - [`RequestError::RateLimited`] for HTTP 429
    /// - [`RequestError::Http`] for any other non-2xx status
    /// - [`RequestError::Timeout`] when the attempt exceeds its deadline
    /// - [`RequestError::Network`] / [`RequestError::Tls`] for transport failures
    #[instrument(level = "debug", skip(self, batch), fields(batch = batch.sequence(), records = batch.len()))]
    pub async fn execute(&self, batch: &Batch, attempt: u32) -> Result<HttpResponse, RequestError> {
        let request = self.prepare(batch)?;
        match self.config.dry_run() {
            DryRun::Describe => return Ok(dry_response(ResponseBody::Json(request.describe()))),
            DryRun::Curl => return Ok(dry_response(ResponseBody::Text(request.to_curl()))),
            DryRun::Off => {}
        }

        let url = request.url().clone();
        let method = request.method().to_string();
        let timeout = self.config.timeout();

        let exchange = async {
            let response = request
                .into_reqwest(&self.client)
                .send()
                .await
                .map_err(|error| RequestError::from_send(url.as_str(), &method, timeout, error))?;
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response
                .bytes()
                .await
                .map_err(|error| RequestError::from_send(url.as_str(), &method, timeout, error))?;
            Ok::<_, RequestError>((status, headers, bytes.to_vec()))
        };
        let (status, raw_headers, bytes) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                warn!(url = %url, attempt, timeout_ms = timeout.as_millis(), "request timed out");
                RequestError::timeout(url.as_str(), &method, timeout)
            })??;

        if let Some(store) = &self.cookies {
            let set_cookies = set_cookie_values(&raw_headers);
            if !set_cookies.is_empty() {
                store.ingest(&set_cookies, &url);
            }
        }

        let headers = header_list(&raw_headers);
        let body = ResponseBody::decode(content_type(&raw_headers).as_deref(), bytes);
        debug!(status = status.as_u16(), attempt, "response received");

        classify(status, headers, body, url.as_str(), &method, &raw_headers)
    }
}

fn classify(
    status: StatusCode,
    headers: HeaderList,
    body: ResponseBody,
    url: &str,
    method: &str,
    raw_headers: &HeaderMap,
) -> Result<HttpResponse, RequestError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = raw_headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let quota = RateLimitQuota::from_headers(&headers);
        warn!(
            url,
            retry_after_ms = retry_after.map(|d| d.as_millis()),
            remaining = quota.remaining,
            "rate limited"
        );
        return Err(RequestError::RateLimited {
            url: url.to_string(),
            method: method.to_string(),
            retry_after,
            quota,
            body: body.to_text(),
            headers,
        });
    }
    if !status.is_success() {
        return Err(RequestError::Http {
            url: url.to_string(),
            method: method.to_string(),
            status: status.as_u16(),
            body: body.to_text(),
            headers,
        });
    }
    Ok(HttpResponse {
        status: status.as_u16(),
        headers,
        body,
    })
}

fn dry_response(body: ResponseBody) -> HttpResponse {
    HttpResponse {
        status: 0,
        headers: HeaderList::new(),
        body,
    }
}

fn set_cookie_values(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

fn build_client(config: &RunConfig) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.timeout().min(Duration::from_secs(30)))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .user_agent(user_agent::default_user_agent());
    if !config.pooling() {
        builder = builder.pool_max_idle_per_host(0);
    }
    builder.build()
}

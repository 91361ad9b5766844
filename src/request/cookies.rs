//! Session cookie handling.
//!
//! The executor reads a `Cookie` header from a [`CookieStore`] before each
//! attempt and feeds `Set-Cookie` response headers back into it, keyed by the
//! request URL. [`JarCookieStore`] is the default store, backed by reqwest's
//! cookie jar so domain, path and secure matching follow browser rules.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::cookie::{CookieStore as _, Jar};
use tracing::{debug, instrument};
use url::Url;

/// Cookie persistence shared by every attempt of a run.
///
/// Implementations must be internally synchronized: concurrent attempts call
/// these methods from different tasks.
pub trait CookieStore: Send + Sync + fmt::Debug {
    /// `Cookie` header value to send to `url`, if any cookie matches.
    fn cookie_header(&self, url: &Url) -> Option<String>;

    /// Merges raw `Set-Cookie` header values received from `url`.
    fn ingest(&self, set_cookie_headers: &[String], url: &Url);

    /// Forgets every cookie.
    fn clear(&self);
}

/// [`CookieStore`] over a `reqwest::cookie::Jar`.
///
/// Cookie values are never logged.
#[derive(Default)]
pub struct JarCookieStore {
    jar: RwLock<Arc<Jar>>,
}

impl JarCookieStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing jar, e.g. one preloaded from a cookie file.
    #[must_use]
    pub fn from_jar(jar: Arc<Jar>) -> Self {
        Self {
            jar: RwLock::new(jar),
        }
    }

    fn current(&self) -> Arc<Jar> {
        Arc::clone(&self.jar.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl fmt::Debug for JarCookieStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JarCookieStore")
            .field("jar", &"[REDACTED]")
            .finish()
    }
}

impl CookieStore for JarCookieStore {
    fn cookie_header(&self, url: &Url) -> Option<String> {
        self.current()
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    #[instrument(level = "debug", skip(self, set_cookie_headers), fields(url = %url, count = set_cookie_headers.len()))]
    fn ingest(&self, set_cookie_headers: &[String], url: &Url) {
        let jar = self.current();
        for header in set_cookie_headers {
            jar.add_cookie_str(header, url);
        }
        debug!("merged response cookies");
    }

    fn clear(&self) {
        *self.jar.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Jar::default());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_empty_store_has_no_header() {
        let store = JarCookieStore::new();
        assert!(store.cookie_header(&url("https://api.example.com/")).is_none());
    }

    #[test]
    fn test_ingest_then_header_for_same_origin() {
        let store = JarCookieStore::new();
        let origin = url("https://api.example.com/ingest");
        store.ingest(&["session=abc; Path=/".to_string()], &origin);
        let header = store.cookie_header(&url("https://api.example.com/other")).unwrap();
        assert_eq!(header, "session=abc");
    }

    #[test]
    fn test_cookies_do_not_leak_to_other_hosts() {
        let store = JarCookieStore::new();
        store.ingest(&["session=abc; Path=/".to_string()], &url("https://a.example.com/"));
        assert!(store.cookie_header(&url("https://b.example.org/")).is_none());
    }

    #[test]
    fn test_clear_forgets_cookies() {
        let store = JarCookieStore::new();
        let origin = url("https://api.example.com/");
        store.ingest(&["session=abc; Path=/".to_string()], &origin);
        store.clear();
        assert!(store.cookie_header(&origin).is_none());
    }

    #[test]
    fn test_debug_redacts_contents() {
        let store = JarCookieStore::new();
        assert!(format!("{store:?}").contains("[REDACTED]"));
    }
}

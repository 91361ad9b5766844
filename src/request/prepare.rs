//! Request construction.
//!
//! A [`PreparedRequest`] is built fresh for every attempt from the run
//! configuration and the task's batch. It is the single description used both
//! for sending and for the dry-run transcripts.

use std::fmt::Write as _;

use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use serde_json::{Map, Value, json};
use url::Url;

use super::cookies::CookieStore;
use super::error::RequestError;
use super::form::{self, FormEncoder, FormError};
use crate::config::{BodyFormat, RunConfig};
use crate::record::Batch;

const JSON_CONTENT_TYPE: &str = "application/json";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A fully built request, ready to send or to describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

impl PreparedRequest {
    /// Builds the request for `batch`.
    ///
    /// Configured headers take precedence over the content type derived from
    /// the body format. Read-only methods never carry a body; their object
    /// records are appended to the query string instead.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidRequest`] when the batch cannot be
    /// encoded in the configured body format.
    pub fn build(
        config: &RunConfig,
        batch: &Batch,
        cookies: Option<&dyn CookieStore>,
        form_encoder: &dyn FormEncoder,
    ) -> Result<Self, RequestError> {
        let method = config.method().clone();
        let url = target_url(config, batch);

        let mut headers: Vec<(String, String)> = config
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut body = None;
        if !config.is_read_only() {
            let encoded = encode_body(config.body_format(), batch, form_encoder)
                .map_err(|error| RequestError::invalid_request(url.as_str(), error.to_string()))?;
            for (name, value) in encoded.headers {
                if !headers.iter().any(|(existing, _)| existing.eq_ignore_ascii_case(&name)) {
                    headers.push((name, value));
                }
            }
            body = Some(encoded.body);
        }

        if let Some(store) = cookies
            && let Some(cookie) = store.cookie_header(&url)
        {
            headers.push((COOKIE.as_str().to_string(), cookie));
        }

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }

    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Final URL including query parameters.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Headers in the order they will be sent.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Body bytes, absent for read-only methods.
    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// JSON description of the request, used by describe-mode dry runs.
    ///
    /// JSON bodies are embedded as values; anything else as text.
    #[must_use]
    pub fn describe(&self) -> Value {
        let headers: Map<String, Value> = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        let body = self.body.as_deref().map_or(Value::Null, |bytes| {
            if self.content_type().is_some_and(|ct| ct.starts_with(JSON_CONTENT_TYPE)) {
                serde_json::from_slice(bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
            } else {
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
        });
        json!({
            "method": self.method.as_str(),
            "url": self.url.as_str(),
            "headers": headers,
            "body": body,
        })
    }

    /// Equivalent `curl` command line with POSIX shell quoting.
    #[must_use]
    pub fn to_curl(&self) -> String {
        let mut command = format!("curl -X {} {}", self.method, shell_quote(self.url.as_str()));
        for (name, value) in &self.headers {
            let _ = write!(command, " -H {}", shell_quote(&format!("{name}: {value}")));
        }
        if let Some(bytes) = &self.body {
            let _ = write!(
                command,
                " --data-binary {}",
                shell_quote(&String::from_utf8_lossy(bytes))
            );
        }
        command
    }

    pub(crate) fn into_reqwest(self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = client.request(self.method, self.url);
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = self.body {
            builder = builder.body(body);
        }
        builder
    }

    fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
            .map(|(_, value)| value.as_str())
    }
}

/// URL a batch is sent to: the configured URL plus configured query
/// parameters, plus the batch's object records for read-only methods.
#[must_use]
pub fn target_url(config: &RunConfig, batch: &Batch) -> Url {
    let mut url = config.url().clone();
    if !config.query().is_empty() {
        url.query_pairs_mut().extend_pairs(config.query());
    }
    if config.is_read_only() {
        let objects: Vec<&Map<String, Value>> = batch
            .records()
            .iter()
            .filter_map(Value::as_object)
            .filter(|fields| !fields.is_empty())
            .collect();
        if !objects.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for fields in objects {
                form::append_pairs(&mut pairs, fields);
            }
        }
    }
    url
}

fn encode_body(
    format: BodyFormat,
    batch: &Batch,
    form_encoder: &dyn FormEncoder,
) -> Result<form::EncodedForm, EncodeError> {
    match format {
        BodyFormat::Json => Ok(form::EncodedForm {
            headers: vec![(CONTENT_TYPE.as_str().to_string(), JSON_CONTENT_TYPE.to_string())],
            body: serde_json::to_vec(&batch.payload())?,
        }),
        BodyFormat::Form => Ok(form::EncodedForm {
            headers: vec![(CONTENT_TYPE.as_str().to_string(), FORM_CONTENT_TYPE.to_string())],
            body: form::encode_urlencoded(batch.records())?.into_bytes(),
        }),
        BodyFormat::Multipart => Ok(form_encoder.encode(&merge_fields(batch.records())?)?),
    }
}

/// Merges the fields of several object records into one form; repeated
/// names collect into arrays so they are sent as repeated parts.
fn merge_fields(records: &[Value]) -> Result<Value, FormError> {
    if let [single] = records {
        return form::as_object(single).map(|_| single.clone());
    }
    let mut merged: Map<String, Value> = Map::new();
    for record in records {
        for (name, value) in form::as_object(record)? {
            match merged.get_mut(name) {
                Some(Value::Array(items)) => items.push(value.clone()),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value.clone()]);
                }
                None => {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }
    }
    Ok(Value::Object(merged))
}

#[derive(Debug, thiserror::Error)]
enum EncodeError {
    #[error(transparent)]
    Form(#[from] FormError),
    #[error("failed to serialize JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::request::cookies::JarCookieStore;
    use crate::request::form::MultipartFormEncoder;

    fn build(config: &RunConfig, records: Vec<Value>) -> PreparedRequest {
        PreparedRequest::build(
            config,
            &Batch::new(0, records),
            None,
            &MultipartFormEncoder::new(),
        )
        .unwrap()
    }

    fn header<'a>(request: &'a PreparedRequest, name: &str) -> Option<&'a str> {
        request
            .headers()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_json_single_record_is_bare() {
        let config = RunConfig::builder("https://api.example.com/in").build().unwrap();
        let request = build(&config, vec![json!({"id": 1})]);
        assert_eq!(request.body().unwrap(), br#"{"id":1}"#);
        assert_eq!(header(&request, "content-type"), Some("application/json"));
    }

    #[test]
    fn test_json_batch_is_array() {
        let config = RunConfig::builder("https://api.example.com/in").build().unwrap();
        let request = build(&config, vec![json!(1), json!(2)]);
        assert_eq!(request.body().unwrap(), b"[1,2]");
    }

    #[test]
    fn test_configured_content_type_wins() {
        let config = RunConfig::builder("https://api.example.com/in")
            .header("Content-Type", "application/vnd.api+json")
            .build()
            .unwrap();
        let request = build(&config, vec![json!({})]);
        let content_types: Vec<_> = request
            .headers()
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("content-type"))
            .collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0].1, "application/vnd.api+json");
    }

    #[test]
    fn test_form_body() {
        let config = RunConfig::builder("https://api.example.com/in")
            .body_format(BodyFormat::Form)
            .build()
            .unwrap();
        let request = build(&config, vec![json!({"a": "x y"})]);
        assert_eq!(request.body().unwrap(), b"a=x+y");
        assert_eq!(
            header(&request, "content-type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn test_form_rejects_non_object() {
        let config = RunConfig::builder("https://api.example.com/in")
            .body_format(BodyFormat::Form)
            .build()
            .unwrap();
        let error = PreparedRequest::build(
            &config,
            &Batch::new(0, vec![json!([1])]),
            None,
            &MultipartFormEncoder::new(),
        )
        .unwrap_err();
        assert!(matches!(error, RequestError::InvalidRequest { .. }));
    }

    #[test]
    fn test_multipart_merges_batch_fields() {
        let config = RunConfig::builder("https://api.example.com/in")
            .body_format(BodyFormat::Multipart)
            .batch_size(2)
            .build()
            .unwrap();
        let request = build(&config, vec![json!({"tag": "a"}), json!({"tag": "b"})]);
        let body = String::from_utf8(request.body().unwrap().to_vec()).unwrap();
        assert_eq!(body.matches("name=\"tag\"").count(), 2);
        assert!(
            header(&request, "content-type")
                .unwrap()
                .starts_with("multipart/form-data; boundary=")
        );
    }

    #[test]
    fn test_read_only_method_moves_record_to_query() {
        let config = RunConfig::builder("https://api.example.com/search?v=1")
            .method("GET")
            .query_param("key", "k")
            .build()
            .unwrap();
        let request = build(&config, vec![json!({"q": "rust lang"})]);
        assert!(request.body().is_none());
        assert_eq!(
            request.url().as_str(),
            "https://api.example.com/search?v=1&key=k&q=rust+lang"
        );
    }

    #[test]
    fn test_cookie_header_injected() {
        let config = RunConfig::builder("https://api.example.com/in").build().unwrap();
        let store = JarCookieStore::new();
        store.ingest(&["sid=42; Path=/".to_string()], config.url());
        let request = PreparedRequest::build(
            &config,
            &Batch::new(0, vec![json!({})]),
            Some(&store),
            &MultipartFormEncoder::new(),
        )
        .unwrap();
        assert_eq!(header(&request, "cookie"), Some("sid=42"));
    }

    #[test]
    fn test_describe_embeds_json_body() {
        let config = RunConfig::builder("https://api.example.com/in").build().unwrap();
        let description = build(&config, vec![json!({"id": 7})]).describe();
        assert_eq!(description["method"], "POST");
        assert_eq!(description["url"], "https://api.example.com/in");
        assert_eq!(description["body"], json!({"id": 7}));
        assert_eq!(description["headers"]["content-type"], "application/json");
    }

    #[test]
    fn test_curl_quotes_single_quotes() {
        let config = RunConfig::builder("https://api.example.com/in").build().unwrap();
        let curl = build(&config, vec![json!({"name": "O'Brien"})]).to_curl();
        assert_eq!(
            curl,
            r#"curl -X POST 'https://api.example.com/in' -H 'content-type: application/json' --data-binary '{"name":"O'\''Brien"}'"#
        );
    }
}

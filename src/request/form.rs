//! Form body encoders.
//!
//! URL-encoded bodies are built directly with `url::form_urlencoded`.
//! Multipart bodies go through the [`FormEncoder`] collaborator so callers can
//! plug in their own encoding (file parts, custom boundaries).
//! [`MultipartFormEncoder`] wraps the `multipart` crate for text and JSON fields.

use std::fmt;
use std::io::{Cursor, Read};

use multipart::client::lazy::Multipart;
use serde_json::{Map, Value};
use thiserror::Error;
use url::form_urlencoded;

/// Errors raised while encoding a form body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    /// Forms are built from JSON objects only.
    #[error("form payload must be a JSON object, got {found}")]
    NotAnObject {
        /// JSON type that was supplied instead.
        found: &'static str,
    },
    /// The multipart writer failed.
    #[error("cannot encode multipart body: {message}")]
    Encoding {
        /// Underlying writer error.
        message: String,
    },
}

/// An encoded body plus the headers that describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedForm {
    /// Headers to add to the request, typically `Content-Type`.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

/// Encodes a record into a multipart body.
pub trait FormEncoder: Send + Sync + fmt::Debug {
    /// Encodes `value`, which is a JSON object of form fields.
    ///
    /// # Errors
    ///
    /// Returns [`FormError`] when the value cannot be represented as a form.
    fn encode(&self, value: &Value) -> Result<EncodedForm, FormError>;
}

/// `multipart/form-data` encoder backed by the `multipart` crate's lazy
/// client writer.
///
/// Scalars become text parts; arrays become repeated parts; nested objects
/// become `application/json` parts. Each call draws a fresh random boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartFormEncoder;

impl MultipartFormEncoder {
    /// Creates the encoder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FormEncoder for MultipartFormEncoder {
    fn encode(&self, value: &Value) -> Result<EncodedForm, FormError> {
        let fields = as_object(value)?;
        let mut form = Multipart::new();
        for (name, field) in fields {
            match field {
                Value::Array(items) => {
                    for item in items {
                        add_part(&mut form, name, item);
                    }
                }
                other => add_part(&mut form, name, other),
            }
        }

        let mut prepared = form.prepare().map_err(|error| FormError::Encoding {
            message: error.error.to_string(),
        })?;
        let mut body = Vec::new();
        prepared
            .read_to_end(&mut body)
            .map_err(|error| FormError::Encoding {
                message: error.to_string(),
            })?;

        Ok(EncodedForm {
            headers: vec![(
                "content-type".to_string(),
                format!("multipart/form-data; boundary={}", prepared.boundary()),
            )],
            body,
        })
    }
}

fn add_part<'n>(form: &mut Multipart<'n, '_>, name: &'n str, value: &Value) {
    if value.is_object() {
        form.add_stream(
            name,
            Cursor::new(value.to_string().into_bytes()),
            None::<&str>,
            Some(mime::APPLICATION_JSON),
        );
    } else {
        form.add_text(name, field_text(value));
    }
}

/// URL-encodes the fields of every object in `records`, in order.
///
/// # Errors
///
/// Returns [`FormError::NotAnObject`] when a record is not a JSON object.
pub fn encode_urlencoded(records: &[Value]) -> Result<String, FormError> {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for record in records {
        append_pairs(&mut serializer, as_object(record)?);
    }
    Ok(serializer.finish())
}

/// Appends object fields as `name=value` pairs, arrays as repeated pairs.
pub(crate) fn append_pairs<T: form_urlencoded::Target>(
    serializer: &mut form_urlencoded::Serializer<'_, T>,
    fields: &Map<String, Value>,
) {
    for (name, field) in fields {
        match field {
            Value::Array(items) => {
                for item in items {
                    serializer.append_pair(name, &field_text(item));
                }
            }
            other => {
                serializer.append_pair(name, &field_text(other));
            }
        }
    }
}

pub(crate) fn as_object(value: &Value) -> Result<&Map<String, Value>, FormError> {
    value.as_object().ok_or(FormError::NotAnObject {
        found: json_type(value),
    })
}

fn field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

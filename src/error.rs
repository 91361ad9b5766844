//! Run-level error types.
//!
//! Per-batch failures never surface here: they are counted in the run result
//! and stored as failure records. A [`BulkError`] means the run was rejected
//! before any I/O (validation, configuration) or aborted part-way (source
//! error, memory ceiling, transform error without a handler).

use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::BufferError;

/// Errors that reject or abort a whole run.
#[derive(Debug, Error)]
pub enum BulkError {
    /// The input has a shape the source adapter cannot use.
    #[error("invalid input: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// A configuration value is out of range or malformed.
    #[error("invalid configuration for `{field}`: {message}")]
    Configuration {
        /// Name of the offending option.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// In-flight payload exceeded the configured memory ceiling.
    #[error("memory ceiling exceeded: {observed_bytes} bytes in flight, limit {limit_bytes}")]
    Memory {
        /// Configured ceiling in bytes.
        limit_bytes: usize,
        /// Estimated in-flight bytes when the ceiling was crossed.
        observed_bytes: usize,
    },

    /// The record source failed part-way through.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A record transform failed and no error handler was installed.
    #[error("transform failed on record {record_index}: {message}")]
    Transform {
        /// Zero-based ingestion index of the record.
        record_index: u64,
        /// The transform's error message.
        message: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Writing results to the destination failed.
    #[error("failed to write results to {path}: {source}")]
    Output {
        /// Destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl BulkError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a configuration error for `field`.
    pub fn configuration(field: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            message: message.into(),
        }
    }
}

impl From<BufferError> for BulkError {
    fn from(error: BufferError) -> Self {
        Self::configuration("buffer_capacity", error.to_string())
    }
}

/// Errors raised while producing records.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Reading the input file failed.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// Input path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A newline-delimited JSON line did not parse.
    #[error("malformed JSON on line {line} of {path}: {source}")]
    MalformedLine {
        /// Input path.
        path: PathBuf,
        /// One-based line number.
        line: u64,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A caller-supplied stream yielded an error.
    #[error("record stream failed: {message}")]
    Stream {
        /// Error text reported by the stream.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display_names_field() {
        let error = BulkError::configuration("timeout", "must be at least 1000ms");
        let msg = error.to_string();
        assert!(msg.contains("`timeout`"), "Expected field in: {msg}");
        assert!(msg.contains("1000ms"), "Expected reason in: {msg}");
    }

    #[test]
    fn test_memory_display() {
        let error = BulkError::Memory {
            limit_bytes: 10,
            observed_bytes: 12,
        };
        assert!(error.to_string().contains("12 bytes in flight"));
    }

    #[test]
    fn test_buffer_error_maps_to_configuration() {
        let error: BulkError = BufferError::InvalidCapacity { capacity: 0 }.into();
        assert!(matches!(
            error,
            BulkError::Configuration {
                field: "buffer_capacity",
                ..
            }
        ));
    }

    #[test]
    fn test_source_error_is_transparent() {
        let error: BulkError = SourceError::Stream {
            message: "upstream closed".to_string(),
        }
        .into();
        assert_eq!(error.to_string(), "record stream failed: upstream closed");
    }
}

//! Source adapter: normalizes inputs into one lazy record stream.
//!
//! Inputs are validated in [`RecordSource::open`] before any request is
//! sent. File inputs holding a single JSON document are parsed once; anything
//! else is read as newline-delimited JSON in fixed-size chunks with a
//! carry-over buffer, so arbitrarily large files stream in bounded memory.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

use crate::error::{BulkError, SourceError};
use crate::record::Record;

/// Files up to this size are probed as a single JSON document first.
pub const WHOLE_DOCUMENT_PROBE_LIMIT: u64 = 16 * 1024 * 1024;

/// Read size for newline-delimited streaming.
const CHUNK_SIZE: usize = 64 * 1024;

/// Single-pass, ordered record stream.
pub type RecordStream = BoxStream<'static, Result<Record, SourceError>>;

/// Input accepted by a run.
pub enum RecordSource {
    /// An in-memory ordered collection.
    Records(Vec<Record>),
    /// A single structured value; arrays are not split.
    Value(Record),
    /// A JSON or newline-delimited JSON file.
    Path(PathBuf),
    /// A caller-provided lazy sequence.
    Stream(RecordStream),
    /// No data; only valid for read-only methods.
    Empty,
}

impl RecordSource {
    /// Wraps any record stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Record, SourceError>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Splits a top-level array into records; any other value is one record.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(records) => Self::Records(records),
            other => Self::Value(other),
        }
    }

    /// Validates the input and opens it as a lazy stream.
    ///
    /// # Errors
    ///
    /// - [`BulkError::Validation`] when the input cannot be used: empty input
    ///   for a method that needs a body, a null value, or a path that is not a
    ///   readable file
    /// - [`BulkError::Source`] when a file cannot be read
    #[instrument(level = "debug", skip(self), fields(kind = self.kind()))]
    pub async fn open(self, read_only: bool) -> Result<RecordStream, BulkError> {
        match self {
            Self::Records(records) => Ok(stream::iter(records.into_iter().map(Ok)).boxed()),
            Self::Value(Value::Null) => Err(BulkError::validation("input value is null")),
            Self::Value(value) => Ok(stream::once(async move { Ok(value) }).boxed()),
            Self::Stream(stream) => Ok(stream),
            Self::Empty if read_only => Ok(stream::empty().boxed()),
            Self::Empty => Err(BulkError::validation(
                "no input records supplied for a method that sends a body",
            )),
            Self::Path(path) => open_path(path).await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Records(_) => "records",
            Self::Value(_) => "value",
            Self::Path(_) => "path",
            Self::Stream(_) => "stream",
            Self::Empty => "empty",
        }
    }
}

impl fmt::Debug for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Records(records) => f.debug_tuple("Records").field(&records.len()).finish(),
            Self::Value(_) => f.write_str("Value"),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

impl From<Vec<Record>> for RecordSource {
    fn from(records: Vec<Record>) -> Self {
        Self::Records(records)
    }
}

impl From<PathBuf> for RecordSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for RecordSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

async fn open_path(path: PathBuf) -> Result<RecordStream, BulkError> {
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|error| BulkError::validation(format!("cannot read {}: {error}", path.display())))?;
    if !metadata.is_file() {
        return Err(BulkError::validation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    if metadata.len() <= WHOLE_DOCUMENT_PROBE_LIMIT {
        let bytes = tokio::fs::read(&path).await.map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        if let Ok(document) = serde_json::from_slice::<Value>(&bytes) {
            debug!(path = %path.display(), "input parsed as a single JSON document");
            return Ok(match document {
                Value::Array(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
                other => stream::once(async move { Ok(other) }).boxed(),
            });
        }
        debug!(path = %path.display(), "input is not one JSON document, reading as NDJSON");
        return Ok(ndjson_stream(Cursor::new(bytes), path));
    }

    debug!(path = %path.display(), size = metadata.len(), "streaming large input as NDJSON");
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(ndjson_stream(file, path))
}

/// Newline-delimited JSON over any async reader.
///
/// Blank lines are skipped. The first malformed line ends the stream with
/// [`SourceError::MalformedLine`].
pub fn ndjson_stream<R>(reader: R, path: PathBuf) -> RecordStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = NdjsonReader {
        reader,
        path,
        carry: Vec::new(),
        consumed: 0,
        scanned: 0,
        chunk: vec![0; CHUNK_SIZE],
        line: 0,
        eof: false,
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        state.next_record().await.map(|item| (item, state))
    })
    .boxed()
}

struct NdjsonReader<R> {
    reader: R,
    path: PathBuf,
    carry: Vec<u8>,
    // Bytes of `carry` already handed out as lines.
    consumed: usize,
    // Bytes of `carry` known to hold no newline.
    scanned: usize,
    chunk: Vec<u8>,
    line: u64,
    eof: bool,
    finished: bool,
}

impl<R: AsyncRead + Unpin> NdjsonReader<R> {
    async fn next_record(&mut self) -> Option<Result<Record, SourceError>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(offset) = self.carry[self.scanned..].iter().position(|byte| *byte == b'\n') {
                let newline = self.scanned + offset;
                let line = self.carry[self.consumed..newline].to_vec();
                self.consumed = newline + 1;
                self.scanned = self.consumed;
                self.line += 1;
                if let Some(item) = self.parse_line(&line) {
                    return Some(item);
                }
                continue;
            }
            self.scanned = self.carry.len();

            if self.eof {
                self.finished = true;
                if self.consumed == self.carry.len() {
                    return None;
                }
                let line = self.carry.split_off(self.consumed);
                self.line += 1;
                return self.parse_line(&line);
            }

            self.carry.drain(..self.consumed);
            self.scanned -= self.consumed;
            self.consumed = 0;
            match self.reader.read(&mut self.chunk).await {
                Ok(0) => self.eof = true,
                Ok(read) => self.carry.extend_from_slice(&self.chunk[..read]),
                Err(source) => {
                    self.finished = true;
                    return Some(Err(SourceError::Io {
                        path: self.path.clone(),
                        source,
                    }));
                }
            }
        }
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<Result<Record, SourceError>> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_slice(trimmed) {
            Ok(record) => Some(Ok(record)),
            Err(source) => {
                self.finished = true;
                Some(Err(SourceError::MalformedLine {
                    path: self.path.clone(),
                    line: self.line,
                    source,
                }))
            }
        }
    }
}

//! Output serializer for run results.
//!
//! CSV output flattens each item to its top-level fields: columns are the
//! union of field names in first-seen order, nested values are written as
//! compact JSON, and a non-object item fills a single `value` column.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::BulkError;

/// Destination file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// One pretty-printed JSON array.
    #[default]
    Json,
    /// One JSON document per line.
    Ndjson,
    /// Comma-separated values with a header row.
    Csv,
}

impl OutputFormat {
    /// Infers the format from the destination extension: `.ndjson` and
    /// `.jsonl` are NDJSON, `.csv` is CSV, everything else JSON.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("ndjson" | "jsonl") => Self::Ndjson,
            Some("csv") => Self::Csv,
            _ => Self::Json,
        }
    }
}

/// Serializes `items` to `writer`.
///
/// # Errors
///
/// Returns the underlying IO error, or a serialization error wrapped as IO.
pub fn serialize_to<W: Write, T: Serialize>(
    mut writer: W,
    format: OutputFormat,
    items: &[T],
) -> io::Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, items)?;
            writer.write_all(b"\n")?;
        }
        OutputFormat::Ndjson => {
            for item in items {
                serde_json::to_writer(&mut writer, item)?;
                writer.write_all(b"\n")?;
            }
        }
        OutputFormat::Csv => write_csv(&mut writer, items)?,
    }
    writer.flush()
}

fn write_csv<W: Write, T: Serialize>(writer: &mut W, items: &[T]) -> io::Result<()> {
    let rows = items
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<Value>, _>>()?;

    let mut columns: Vec<String> = Vec::new();
    for row in &rows {
        let names: Vec<&str> = match row {
            Value::Object(fields) => fields.keys().map(String::as_str).collect(),
            _ => vec!["value"],
        };
        for name in names {
            if !columns.iter().any(|column| column == name) {
                columns.push(name.to_string());
            }
        }
    }

    let header: Vec<String> = columns.iter().map(|column| csv_field(column)).collect();
    writeln!(writer, "{}", header.join(","))?;
    for row in &rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| {
                let cell = match row {
                    Value::Object(fields) => fields.get(column),
                    other if column == "value" => Some(other),
                    _ => None,
                };
                csv_field(&cell.map(cell_text).unwrap_or_default())
            })
            .collect();
        writeln!(writer, "{}", cells.join(","))?;
    }
    Ok(())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

// RFC 4180 quoting.
fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Writes `items` to `path`, inferring the format when `format` is `None`.
///
/// # Errors
///
/// Returns [`BulkError::Output`] if the file cannot be created or written.
#[instrument(skip(items), fields(path = %path.display(), count = items.len()))]
pub fn write_responses<T: Serialize>(
    path: &Path,
    format: Option<OutputFormat>,
    items: &[T],
) -> Result<(), BulkError> {
    let format = format.unwrap_or_else(|| OutputFormat::from_path(path));
    let to_output_error = |source| BulkError::Output {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(to_output_error)?;
    serialize_to(BufWriter::new(file), format, items).map_err(to_output_error)?;
    debug!(?format, "results written");
    Ok(())
}

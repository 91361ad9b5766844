//! Records and batches, the units of input and dispatch.
//!
//! A [`Record`] is any JSON value. The batcher and the dispatch queue never
//! look inside it; only the HTTP executor interprets its shape when encoding
//! a request body.

use serde_json::Value;

/// One unit of input data.
pub type Record = Value;

/// An ordered, frozen group of records sent together in one request.
///
/// Batches are created by the [`Batcher`](crate::batch::Batcher) and owned by
/// exactly one dispatch task. Once frozen they are never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    sequence: u64,
    records: Vec<Record>,
}

impl Batch {
    /// Freezes `records` into a batch with the given submission sequence number.
    #[must_use]
    pub fn new(sequence: u64, records: Vec<Record>) -> Self {
        Self { sequence, records }
    }

    /// Zero-based submission order of this batch within its run.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Records in ingestion order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when the batch carries no records.
    ///
    /// Only a body-less request (read-only method without input) is sent
    /// with an empty batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consumes the batch, returning its records.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Approximate in-memory footprint, measured as serialized JSON length.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        self.records.iter().map(estimated_record_bytes).sum()
    }

    /// Value used as the request payload.
    ///
    /// A single-record batch sends the bare record; larger batches are sent as
    /// a JSON array.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self.records.as_slice() {
            [single] => single.clone(),
            many => Value::Array(many.to_vec()),
        }
    }
}

/// Serialized length of a record, used for memory accounting.
#[must_use]
pub fn estimated_record_bytes(record: &Record) -> usize {
    serde_json::to_vec(record).map_or(0, |bytes| bytes.len())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn single_record_payload_is_bare() {
        let batch = Batch::new(0, vec![json!({"id": 1})]);
        assert_eq!(batch.payload(), json!({"id": 1}));
    }

    #[test]
    fn multi_record_payload_is_array() {
        let batch = Batch::new(3, vec![json!(1), json!(2)]);
        assert_eq!(batch.payload(), json!([1, 2]));
        assert_eq!(batch.sequence(), 3);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn estimated_bytes_sums_serialized_lengths() {
        let batch = Batch::new(0, vec![json!("ab"), json!(10)]);
        // "\"ab\"" is 4 bytes, "10" is 2 bytes
        assert_eq!(batch.estimated_bytes(), 6);
    }
}

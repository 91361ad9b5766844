//! Batcher and flow controller.
//!
//! Records are appended to the batch being filled; a full batch is frozen
//! and handed out by value, so the task that sends it owns it outright.
//! The controller also counts submissions to the current queue generation and
//! pauses ingestion when the count reaches the queued-task limit.

use std::mem;

use tracing::{debug, trace};

use crate::record::{Batch, Record};

/// Ingestion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Accepting records into the current batch.
    Filling,
    /// A frozen batch has been handed out and awaits submission.
    Flushing,
    /// The queue generation is full; ingestion waits for a drain.
    Paused,
}

/// Groups records into batches and tracks queue pressure.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    max_queued_tasks: usize,
    current: Vec<Record>,
    next_sequence: u64,
    queued_in_generation: usize,
    state: FlowState,
}

impl Batcher {
    /// Creates a batcher; `batch_size` and `max_queued_tasks` are clamped to at least 1.
    #[must_use]
    pub fn new(batch_size: usize, max_queued_tasks: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            max_queued_tasks: max_queued_tasks.max(1),
            current: Vec::with_capacity(batch_size),
            next_sequence: 0,
            queued_in_generation: 0,
            state: FlowState::Filling,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Records waiting in the partial batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.current.len()
    }

    /// Tasks submitted to the current queue generation.
    #[must_use]
    pub fn queued_in_generation(&self) -> usize {
        self.queued_in_generation
    }

    /// Appends a record, returning the frozen batch once it is full.
    pub fn push(&mut self, record: Record) -> Option<Batch> {
        debug_assert_eq!(self.state, FlowState::Filling, "push while not filling");
        self.current.push(record);
        if self.current.len() >= self.batch_size {
            Some(self.freeze())
        } else {
            None
        }
    }

    /// Freezes the partial batch at end of stream, if it is non-empty.
    pub fn finish(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.freeze())
        }
    }

    /// Records that a frozen batch was handed to the queue.
    ///
    /// Returns `true` when the generation is now full and the caller must
    /// drain before ingesting more records.
    pub fn record_submission(&mut self) -> bool {
        self.queued_in_generation += 1;
        if self.queued_in_generation >= self.max_queued_tasks {
            debug!(
                queued = self.queued_in_generation,
                max_queued_tasks = self.max_queued_tasks,
                "queue generation full, pausing ingestion"
            );
            self.state = FlowState::Paused;
            true
        } else {
            self.state = FlowState::Filling;
            false
        }
    }

    /// Resumes ingestion against a fresh queue generation.
    pub fn resume(&mut self) {
        self.queued_in_generation = 0;
        self.state = FlowState::Filling;
    }

    fn freeze(&mut self) -> Batch {
        let records = mem::replace(&mut self.current, Vec::with_capacity(self.batch_size));
        let batch = Batch::new(self.next_sequence, records);
        self.next_sequence += 1;
        self.state = FlowState::Flushing;
        trace!(batch = batch.sequence(), records = batch.len(), "batch frozen");
        batch
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn batch_sizes(records: usize, batch_size: usize) -> Vec<usize> {
        let mut batcher = Batcher::new(batch_size, usize::MAX);
        let mut sizes = Vec::new();
        for i in 0..records {
            if let Some(batch) = batcher.push(json!(i)) {
                sizes.push(batch.len());
                batcher.record_submission();
            }
        }
        if let Some(batch) = batcher.finish() {
            sizes.push(batch.len());
        }
        sizes
    }

    #[test]
    fn test_ten_records_batch_three() {
        assert_eq!(batch_sizes(10, 3), vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_batch_count_is_ceiling() {
        for (n, b) in [(1, 1), (7, 7), (8, 7), (100, 9), (0, 4)] {
            let sizes = batch_sizes(n, b);
            assert_eq!(sizes.len(), n.div_ceil(b), "n={n} b={b}");
            assert_eq!(sizes.iter().sum::<usize>(), n);
        }
    }

    #[test]
    fn test_records_keep_ingestion_order() {
        let mut batcher = Batcher::new(2, 10);
        assert!(batcher.push(json!("a")).is_none());
        let batch = batcher.push(json!("b")).unwrap();
        assert_eq!(batch.records(), &[json!("a"), json!("b")]);
        assert_eq!(batch.sequence(), 0);
        batcher.record_submission();
        assert!(batcher.push(json!("c")).is_none());
        let batch = batcher.finish().unwrap();
        assert_eq!(batch.sequence(), 1);
        assert_eq!(batch.records(), &[json!("c")]);
    }

    #[test]
    fn test_state_transitions() {
        let mut batcher = Batcher::new(1, 2);
        assert_eq!(batcher.state(), FlowState::Filling);

        batcher.push(json!(1)).unwrap();
        assert_eq!(batcher.state(), FlowState::Flushing);
        assert!(!batcher.record_submission());
        assert_eq!(batcher.state(), FlowState::Filling);

        batcher.push(json!(2)).unwrap();
        assert!(batcher.record_submission());
        assert_eq!(batcher.state(), FlowState::Paused);
        assert_eq!(batcher.queued_in_generation(), 2);

        batcher.resume();
        assert_eq!(batcher.state(), FlowState::Filling);
        assert_eq!(batcher.queued_in_generation(), 0);
    }

    #[test]
    fn test_finish_on_empty_is_none() {
        let mut batcher = Batcher::new(5, 5);
        assert!(batcher.finish().is_none());
        assert_eq!(batcher.pending(), 0);
    }
}

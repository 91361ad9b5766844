//! Fixed-capacity result storage.
//!
//! [`RingBuffer`] keeps the most recent `capacity` entries over a fixed-size
//! slot array with head/tail indices. Pushing is O(1); once full, each push
//! overwrites the oldest entry. [`ResultSink`] wraps the buffer so storage can
//! be disabled entirely for fire-and-forget workloads.
//!
//! # Example
//!
//! ```
//! use bulkhttp_core::buffer::RingBuffer;
//!
//! let mut buffer = RingBuffer::new(2).unwrap();
//! buffer.push("a");
//! buffer.push("b");
//! buffer.push("c");
//! assert_eq!(buffer.to_vec(), vec!["b", "c"]);
//! ```

use thiserror::Error;

/// Errors raised by buffer construction and resizing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Capacity must be at least one slot.
    #[error("buffer capacity must be positive, got {capacity}")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: usize,
    },
}

/// Circular buffer retaining the newest `capacity` items in insertion order.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Next slot to write.
    head: usize,
    /// Oldest occupied slot.
    tail: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` items.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidCapacity`] when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity { capacity });
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            head: 0,
            tail: 0,
            len: 0,
        })
    }

    /// Maximum number of retained items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of items currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when nothing has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true when the next push will evict the oldest item.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Appends `item`, evicting the oldest entry when the buffer is full.
    pub fn push(&mut self, item: T) {
        let capacity = self.capacity();
        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % capacity;
        if self.len == capacity {
            self.tail = (self.tail + 1) % capacity;
        } else {
            self.len += 1;
        }
    }

    /// Iterates retained items from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |offset| self.slots[(self.tail + offset) % capacity].as_ref())
    }

    /// Removes every item, keeping the capacity.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    /// Drains retained items from oldest to newest, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<T> {
        let capacity = self.capacity();
        let mut items = Vec::with_capacity(self.len);
        for offset in 0..self.len {
            if let Some(item) = self.slots[(self.tail + offset) % capacity].take() {
                items.push(item);
            }
        }
        self.head = 0;
        self.tail = 0;
        self.len = 0;
        items
    }

    /// Rebuilds the buffer with a new capacity, keeping the most recent
    /// `min(len, new_capacity)` items.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidCapacity`] when `new_capacity` is zero;
    /// the buffer is left untouched.
    pub fn resize(&mut self, new_capacity: usize) -> Result<(), BufferError> {
        let mut rebuilt = Self::new(new_capacity)?;
        let items = self.drain();
        let skip = items.len().saturating_sub(new_capacity);
        for item in items.into_iter().skip(skip) {
            rebuilt.push(item);
        }
        *self = rebuilt;
        Ok(())
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copies retained items, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// The oldest `n` items, or everything when fewer are retained.
    #[must_use]
    pub fn first(&self, n: usize) -> Vec<T> {
        self.iter().take(n).cloned().collect()
    }

    /// The newest `n` items in insertion order, or everything when fewer are retained.
    #[must_use]
    pub fn last(&self, n: usize) -> Vec<T> {
        self.iter().skip(self.len.saturating_sub(n)).cloned().collect()
    }
}

/// Destination for concluded task outcomes.
#[derive(Debug)]
pub enum ResultSink<T> {
    /// Keep the newest outcomes in a ring buffer.
    Buffer(RingBuffer<T>),
    /// Drop every outcome.
    Discard,
}

impl<T> ResultSink<T> {
    /// Builds a buffering sink, or a discarding one when `store` is false.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidCapacity`] when storing with zero capacity.
    pub fn new(store: bool, capacity: usize) -> Result<Self, BufferError> {
        if store {
            Ok(Self::Buffer(RingBuffer::new(capacity)?))
        } else {
            Ok(Self::Discard)
        }
    }

    /// Records an outcome; a no-op for [`ResultSink::Discard`].
    pub fn push(&mut self, item: T) {
        if let Self::Buffer(buffer) = self {
            buffer.push(item);
        }
    }

    /// Number of stored outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Buffer(buffer) => buffer.len(),
            Self::Discard => 0,
        }
    }

    /// Returns true when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every stored outcome, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        match self {
            Self::Buffer(buffer) => buffer.drain(),
            Self::Discard => Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            RingBuffer::<u8>::new(0).unwrap_err(),
            BufferError::InvalidCapacity { capacity: 0 }
        );
    }

    #[test]
    fn test_push_below_capacity_keeps_everything() {
        let mut buffer = RingBuffer::new(4).unwrap();
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.to_vec(), vec![1, 2]);
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_overflow_keeps_most_recent_in_order() {
        let mut buffer = RingBuffer::new(3).unwrap();
        for value in 0..10 {
            buffer.push(value);
        }
        assert_eq!(buffer.to_vec(), vec![7, 8, 9]);
        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_capacity_two_three_pushes() {
        let mut buffer = RingBuffer::new(2).unwrap();
        buffer.push("A");
        buffer.push("B");
        buffer.push("C");
        assert_eq!(buffer.to_vec(), vec!["B", "C"]);
    }

    #[test]
    fn test_resize_smaller_keeps_newest() {
        let mut buffer = RingBuffer::new(5).unwrap();
        for value in 0..7 {
            buffer.push(value);
        }
        buffer.resize(2).unwrap();
        assert_eq!(buffer.to_vec(), vec![5, 6]);
        assert_eq!(buffer.capacity(), 2);

        buffer.push(7);
        assert_eq!(buffer.to_vec(), vec![6, 7]);
    }

    #[test]
    fn test_resize_larger_keeps_all() {
        let mut buffer = RingBuffer::new(3).unwrap();
        for value in 0..5 {
            buffer.push(value);
        }
        buffer.resize(10).unwrap();
        assert_eq!(buffer.to_vec(), vec![2, 3, 4]);
        buffer.push(5);
        assert_eq!(buffer.to_vec(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_resize_zero_rejected_and_buffer_untouched() {
        let mut buffer = RingBuffer::new(2).unwrap();
        buffer.push(1);
        assert!(buffer.resize(0).is_err());
        assert_eq!(buffer.to_vec(), vec![1]);
    }

    #[test]
    fn test_first_and_last() {
        let mut buffer = RingBuffer::new(4).unwrap();
        for value in 1..=6 {
            buffer.push(value);
        }
        assert_eq!(buffer.first(2), vec![3, 4]);
        assert_eq!(buffer.last(2), vec![5, 6]);
        assert_eq!(buffer.first(10), vec![3, 4, 5, 6]);
        assert_eq!(buffer.last(10), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_drain_empties_buffer() {
        let mut buffer = RingBuffer::new(2).unwrap();
        buffer.push(1);
        buffer.push(2);
        buffer.push(3);
        assert_eq!(buffer.drain(), vec![2, 3]);
        assert!(buffer.is_empty());
        buffer.push(4);
        assert_eq!(buffer.to_vec(), vec![4]);
    }

    #[test]
    fn test_discard_sink_stores_nothing() {
        let mut sink = ResultSink::new(false, 0).unwrap();
        sink.push(1);
        assert!(sink.is_empty());
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_buffer_sink_rejects_zero_capacity() {
        assert!(ResultSink::<u8>::new(true, 0).is_err());
    }
}

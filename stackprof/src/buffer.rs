use alloc::vec::Vec;
use core::slice;

use crate::interface::*;

/// Fixed-capacity, append-only store of captured traces.
///
/// Storage is sized once in [`reset`](SampleBuffer::reset), which is the only
/// place that allocates. Once full, appends are counted as dropped instead of
/// overwriting older records.
#[derive(Debug)]
pub struct SampleBuffer {
    records: Vec<StackTrace>,
    cursor: usize,
    dropped: usize,
}

impl SampleBuffer {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
            cursor: 0,
            dropped: 0,
        }
    }

    /// Sizes the buffer for exactly `capacity` records and clears all counters.
    pub fn reset(&mut self, capacity: usize) {
        self.records.clear();
        self.records.shrink_to(capacity);
        self.records.resize(capacity, StackTrace::EMPTY);
        self.cursor = 0;
        self.dropped = 0;
    }

    /// Stores a copy of `trace`, or counts it as dropped if the buffer is full.
    pub fn try_append(&mut self, trace: &StackTrace) -> bool {
        match self.records.get_mut(self.cursor) {
            Some(slot) => {
                *slot = *trace;
                self.cursor += 1;
                true
            }
            None => {
                self.dropped = self.dropped.saturating_add(1);
                false
            }
        }
    }

    /// Recorded traces in capture order.
    pub fn iter(&self) -> slice::Iter<'_, StackTrace> {
        self.records[..self.cursor].iter()
    }

    /// Samples lost to a full buffer since the last reset.
    pub fn dropped_count(&self) -> usize {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn is_full(&self) -> bool {
        self.cursor == self.records.len()
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> IntoIterator for &'a SampleBuffer {
    type Item = &'a StackTrace;
    type IntoIter = slice::Iter<'a, StackTrace>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

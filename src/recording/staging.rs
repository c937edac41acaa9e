// src/recording/staging.rs
//! Fixed-capacity staging buffer between the source and the persister
//!
//! One contiguous allocation with two cursors:
//!
//! ```text
//! 0            in_flight          filled             capacity
//! |--- writing ---|--- waiting ------|------ free ------|
//! ```
//!
//! New bytes land after `filled`. A drain hands `[0, filled)` to the
//! persister; once the write completes the written prefix is dropped and
//! the tail is moved to the front.

use crate::utils::errors::{EngineError, Result};

/// Staging buffer owned by the record loop
pub struct StagingBuffer {
    data: Box<[u8]>,
    filled: usize,
    in_flight: usize,
}

impl StagingBuffer {
    /// Allocate a buffer of `capacity` bytes
    ///
    /// Allocation failure is reported instead of aborting the process.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(EngineError::ConfigError(
                "staging buffer capacity must be positive".to_string(),
            ));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|e| {
            EngineError::OutOfMemory(format!(
                "unable to allocate staging buffer of {} bytes: {}",
                capacity, e
            ))
        })?;
        data.resize(capacity, 0);

        Ok(Self {
            data: data.into_boxed_slice(),
            filled: 0,
            in_flight: 0,
        })
    }

    /// Copy as much of `bytes` as fits; returns the count accepted
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let accepted = bytes.len().min(self.room());
        self.data[self.filled..self.filled + accepted].copy_from_slice(&bytes[..accepted]);
        self.filled += accepted;
        accepted
    }

    /// Free tail of at most `limit` bytes, for reading straight into the buffer
    ///
    /// Bytes written there become part of the buffer only after [`commit`](Self::commit).
    pub fn spare(&mut self, limit: usize) -> &mut [u8] {
        let end = self.filled + limit.min(self.room());
        &mut self.data[self.filled..end]
    }

    /// Account for `n` bytes written into [`spare`](Self::spare)
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.room(), "commit past capacity");
        self.filled += n.min(self.room());
    }

    /// Mark `[0, filled)` as in flight and return it
    ///
    /// Must not be called while an earlier drain is still in flight.
    pub fn begin_drain(&mut self) -> &[u8] {
        debug_assert_eq!(self.in_flight, 0, "drain already in flight");
        self.in_flight = self.filled;
        &self.data[..self.filled]
    }

    /// Drop the first `written` bytes and move the rest to the front
    ///
    /// Bytes of a partial write stay at the front and go out with the next drain.
    pub fn complete_drain(&mut self, written: usize) {
        let written = written.min(self.in_flight);
        if written > 0 {
            self.data.copy_within(written..self.filled, 0);
            self.filled -= written;
        }
        self.in_flight = 0;
    }

    /// Buffer capacity, fixed at construction
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes held, in flight or waiting
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Bytes handed to the current write
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Free space
    pub fn room(&self) -> usize {
        self.data.len() - self.filled
    }

    /// True when no byte can be accepted (the overflow condition)
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Buffered bytes, in flight or not
    pub fn contents(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Snapshot of the cursors
    pub fn stats(&self) -> StagingStats {
        StagingStats {
            capacity: self.capacity(),
            filled: self.filled,
            in_flight: self.in_flight,
        }
    }
}

/// Staging buffer cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingStats {
    pub capacity: usize,
    pub filled: usize,
    pub in_flight: usize,
}

impl StagingStats {
    /// Fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.filled as f64 / self.capacity as f64) * 100.0
    }
}

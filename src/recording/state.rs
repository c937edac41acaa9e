// src/recording/state.rs
//! Session state and caller-visible status
//!
//! The loop thread is the only writer of failure states; the control
//! thread requests a stop and, after joining the loop, sets `Stopped`.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Internal session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RecordState {
    /// No loop running (initial and terminal)
    Stopped = 0,

    /// Loop recording
    Running = 1,

    /// Source read failed
    FailedRead = 2,

    /// Staging buffer full; reported while it lasts, the loop keeps running
    FailedOverflow = 3,

    /// Destination write failed
    FailedFile = 4,

    /// Memory allocation failed
    FailedMemory = 5,
}

impl RecordState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RecordState::Running,
            2 => RecordState::FailedRead,
            3 => RecordState::FailedOverflow,
            4 => RecordState::FailedFile,
            5 => RecordState::FailedMemory,
            _ => RecordState::Stopped,
        }
    }

    /// True for states that end the session (everything except overflow)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RecordState::FailedRead | RecordState::FailedFile | RecordState::FailedMemory
        )
    }
}

/// Coarse status for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Keeping up
    Ok,

    /// The buffer overflowed earlier in the session; cleared by `reset_status`
    Slow,

    /// The buffer is full right now, or the session failed
    Overflow,
}

/// State shared between a session handle and its loop thread
pub(crate) struct SharedState {
    state: AtomicU8,
    stop_requested: AtomicBool,
    overflowing: AtomicBool,
    slow: AtomicBool,
    pub(crate) bytes_read: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) writes: AtomicU64,
    pub(crate) overflow_episodes: AtomicU64,
    pub(crate) buffer_fill: AtomicUsize,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RecordState::Running as u8),
            stop_requested: AtomicBool::new(false),
            overflowing: AtomicBool::new(false),
            slow: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            overflow_episodes: AtomicU64::new(0),
            buffer_fill: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> RecordState {
        RecordState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RecordState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Enter the overflow condition; latches `Slow`
    pub(crate) fn begin_overflow(&self) {
        self.overflowing.store(true, Ordering::Release);
        self.slow.store(true, Ordering::Release);
        self.overflow_episodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end_overflow(&self) {
        self.overflowing.store(false, Ordering::Release);
    }

    pub(crate) fn is_overflowing(&self) -> bool {
        self.overflowing.load(Ordering::Acquire)
    }

    pub(crate) fn reset_slow(&self) {
        self.slow.store(false, Ordering::Release);
    }

    /// State as seen by callers: a running loop with a full buffer reads as
    /// `FailedOverflow`
    pub(crate) fn visible_state(&self) -> RecordState {
        match self.state() {
            RecordState::Running if self.is_overflowing() => RecordState::FailedOverflow,
            state => state,
        }
    }

    pub(crate) fn status(&self) -> RecordStatus {
        let state = self.visible_state();
        if state.is_fatal() || state == RecordState::FailedOverflow {
            RecordStatus::Overflow
        } else if self.slow.load(Ordering::Acquire) {
            RecordStatus::Slow
        } else {
            RecordStatus::Ok
        }
    }
}

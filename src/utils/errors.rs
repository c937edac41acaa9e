// src/utils/errors.rs
//! Engine error types
//!
//! Every fallible engine API returns [`Result`]. Errors raised inside the
//! record loop never cross the caller boundary directly: they are folded
//! into a terminal [`RecordState`] via [`EngineError::state_on_failure`].

use crate::recording::RecordState;
use thiserror::Error;

/// Engine error
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Source failed: {0}")]
    SourceFailed(String),

    #[error("Source is not attached")]
    SourceDetached,

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("A write is already in flight")]
    WriteInFlight,

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawnFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Terminal session state for an error raised inside the record loop
    pub fn state_on_failure(&self) -> RecordState {
        match self {
            EngineError::OutOfMemory(_) => RecordState::FailedMemory,
            EngineError::SourceFailed(_) | EngineError::SourceDetached => RecordState::FailedRead,
            _ => RecordState::FailedFile,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

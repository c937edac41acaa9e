// src/recording/mod.rs
//! Transport stream recording
//!
//! - **Recorder**: record engine and its per-session loop thread
//! - **Session**: caller handle (status, pid changes, stop)
//! - **Staging**: fixed-capacity buffer between source and persister
//! - **Persister**: single-outstanding-write append sink
//! - **Pids**: secondary pid reconciliation
//!
//! # Architecture
//!
//! ```text
//! SourceReader → read (≤50ms) → StagingBuffer → submit → Persister
//!                                    ↑                      ↓
//!                                compact  ←── poll (non-blocking)
//! ```
//!
//! The loop never waits on a write while recording. When the buffer is
//! full it stops reading and reports overflow until a write completes.

pub mod persister;
pub mod pids;
pub mod recorder;
pub mod session;
pub mod staging;
pub mod state;

// Re-export commonly used types
pub use persister::{FilePersister, MemoryPersister, MemoryPersisterHandle, Persister, WriteStatus};
pub use pids::PidDiff;
pub use recorder::{RecordEngine, RecorderConfig};
pub use session::{RecordSession, SessionReport, SessionStats};
pub use staging::{StagingBuffer, StagingStats};
pub use state::{RecordState, RecordStatus};

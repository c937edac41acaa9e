// src/lib.rs
//! Live transport stream recording engine
//!
//! Records the packets of a demultiplexer into an append-only file while
//! the stream is live. Reads are bounded, writes are asynchronous, and a
//! fixed staging buffer absorbs the difference between the two.
//!
//! # Architecture
//!
//! - **source**: demultiplexer readers (stream device, mock)
//! - **recording**: staging buffer, persister, record engine and sessions
//! - **observability**: tracing and Prometheus setup
//! - **utils**: errors and configuration
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tsrec_engine::recording::{MemoryPersister, RecordEngine, RecordStatus, RecorderConfig};
//! use tsrec_engine::source::MockSource;
//!
//! let engine = RecordEngine::new(RecorderConfig::default())?;
//! let source = Arc::new(MockSource::finite(188 * 7, 188 * 700));
//! let (persister, written) = MemoryPersister::instant();
//!
//! let mut session = engine.start_with_persister(source, Box::new(persister), 0x100, &[0x101])?;
//! assert_ne!(session.status(), RecordStatus::Overflow);
//!
//! let report = session.stop()?;
//! assert_eq!(report.bytes_written, written.len() as u64);
//! # Ok::<(), tsrec_engine::EngineError>(())
//! ```

pub mod observability;
pub mod recording;
pub mod source;
pub mod utils;

// Re-export commonly used types
pub use recording::{RecordEngine, RecordSession, RecordState, RecordStatus, RecorderConfig};
pub use source::{Pid, SourceReader};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

// src/source/mod.rs
//! Transport stream sources
//!
//! A [`SourceReader`] wraps a demultiplexer that delivers raw transport
//! stream bytes for a selected set of packet identifiers. The recorder only
//! needs bounded-timeout reads and pid selection; tuning and filter
//! programming belong to the driver behind the reader.
//!
//! - **StreamSource**: DVR character device, FIFO or plain file
//! - **MockSource**: deterministic generator for tests and demos

pub mod mock;
pub mod stream;

pub use mock::{MockSource, MockSourceConfig};
pub use stream::StreamSource;

use crate::utils::errors::Result;
use std::time::Duration;

/// Packet identifier; opaque to the recorder
pub type Pid = u16;

/// Result of a single bounded read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were written to the front of the destination slice
    Data(usize),

    /// Nothing arrived within the timeout
    Empty,

    /// The source dropped data on its side (device ring overflowed)
    Overrun,
}

/// Demultiplexer contract used by the record loop
///
/// Methods take `&self`: the loop thread reads while the control thread
/// changes the pid selection, so implementations synchronize internally.
pub trait SourceReader: Send + Sync {
    /// Open the underlying device. `buffer_hint` is the kernel-side buffer
    /// size the caller would like, implementations may ignore it.
    fn open(&self, buffer_hint: usize) -> Result<()>;

    /// Select the primary (video) pid; always first in [`current_pids`](Self::current_pids)
    fn set_primary_pid(&self, pid: Pid) -> Result<()>;

    /// Add a pid to the selection
    fn add_pid(&self, pid: Pid) -> Result<()>;

    /// Remove a pid from the selection
    fn remove_pid(&self, pid: Pid);

    /// Start delivering data
    fn start(&self) -> Result<()>;

    /// Stop delivering data
    fn stop(&self);

    /// Read at most `dst.len()` bytes, blocking no longer than `timeout`
    fn read(&self, dst: &mut [u8], timeout: Duration) -> Result<ReadOutcome>;

    /// Current selection, primary pid first
    fn current_pids(&self) -> Vec<Pid>;

    /// Release the device and forget the pid selection
    ///
    /// A later [`open`](Self::open) starts from an empty selection.
    fn close(&self);
}

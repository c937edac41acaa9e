// src/source/mock.rs
//! Mock transport stream source for testing without tuner hardware
//!
//! Produces a deterministic pseudo-random byte stream and keeps a copy of
//! everything it delivered, so a test can compare the recorded file
//! against exactly what the recorder was given.

use crate::source::{Pid, ReadOutcome, SourceReader};
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Mock source behavior
#[derive(Debug, Clone)]
pub struct MockSourceConfig {
    /// Maximum bytes returned by one read
    pub chunk_size: usize,

    /// Stop producing after this many bytes (`None` = endless)
    pub total: Option<usize>,

    /// Simulated latency of a read that returns data
    pub read_delay: Duration,

    /// Longest wait of a read that returns nothing
    pub empty_wait: Duration,

    /// Fail with a fatal error once this many reads returned data
    pub fail_after_reads: Option<u64>,

    /// Pids the source refuses to add
    pub reject_pids: Vec<Pid>,

    /// Seed of the byte generator
    pub seed: u64,
}

impl Default for MockSourceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 128 * 1024,
            total: None,
            read_delay: Duration::ZERO,
            empty_wait: Duration::from_millis(1),
            fail_after_reads: None,
            reject_pids: Vec::new(),
            seed: 0x5EED,
        }
    }
}

struct Generator {
    rng: StdRng,
    delivered: Vec<u8>,
    data_reads: u64,
}

/// A scripted [`SourceReader`]
///
/// # Example
///
/// ```
/// use tsrec_engine::source::{MockSource, MockSourceConfig, ReadOutcome, SourceReader};
/// use std::time::Duration;
///
/// let source = MockSource::new(MockSourceConfig {
///     chunk_size: 188,
///     total: Some(188),
///     ..Default::default()
/// });
/// source.start().unwrap();
///
/// let mut buf = [0u8; 1024];
/// let outcome = source.read(&mut buf, Duration::from_millis(10)).unwrap();
/// assert_eq!(outcome, ReadOutcome::Data(188));
/// assert_eq!(source.delivered(), buf[..188].to_vec());
/// ```
pub struct MockSource {
    config: MockSourceConfig,
    generator: Mutex<Generator>,
    pids: Mutex<Vec<Pid>>,
    opened: AtomicBool,
    running: AtomicBool,
    overrun_pending: AtomicBool,
    add_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl MockSource {
    /// Create a new mock source
    pub fn new(config: MockSourceConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            generator: Mutex::new(Generator {
                rng,
                delivered: Vec::new(),
                data_reads: 0,
            }),
            pids: Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            running: AtomicBool::new(false),
            overrun_pending: AtomicBool::new(false),
            add_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
        }
    }

    /// Endless source delivering `chunk_size` bytes per read
    pub fn endless(chunk_size: usize) -> Self {
        Self::new(MockSourceConfig {
            chunk_size,
            ..Default::default()
        })
    }

    /// Finite source delivering `total` bytes in `chunk_size` reads
    pub fn finite(chunk_size: usize, total: usize) -> Self {
        Self::new(MockSourceConfig {
            chunk_size,
            total: Some(total),
            ..Default::default()
        })
    }

    /// Copy of every byte delivered so far
    pub fn delivered(&self) -> Vec<u8> {
        self.generator.lock().delivered.clone()
    }

    /// Number of bytes delivered so far
    pub fn delivered_len(&self) -> usize {
        self.generator.lock().delivered.len()
    }

    /// True once `total` bytes were delivered
    pub fn is_exhausted(&self) -> bool {
        match self.config.total {
            Some(total) => self.delivered_len() >= total,
            None => false,
        }
    }

    /// Make the next read report a device-side overrun
    pub fn inject_overrun(&self) {
        self.overrun_pending.store(true, Ordering::SeqCst);
    }

    /// Number of `add_pid` calls that reached the source
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    /// Number of `remove_pid` calls that reached the source
    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// True between `open` and `close`
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// True while started
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn wait_empty(&self, timeout: Duration) -> Result<ReadOutcome> {
        std::thread::sleep(timeout.min(self.config.empty_wait));
        Ok(ReadOutcome::Empty)
    }
}

impl SourceReader for MockSource {
    fn open(&self, _buffer_hint: usize) -> Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_primary_pid(&self, pid: Pid) -> Result<()> {
        let mut pids = self.pids.lock();
        pids.retain(|p| *p != pid);
        pids.insert(0, pid);
        Ok(())
    }

    fn add_pid(&self, pid: Pid) -> Result<()> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(EngineError::SourceFailed("mock source not open".to_string()));
        }
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.config.reject_pids.contains(&pid) {
            return Err(EngineError::SourceFailed(format!(
                "mock source rejects pid 0x{:04x}",
                pid
            )));
        }
        self.pids.lock().push(pid);
        Ok(())
    }

    fn remove_pid(&self, pid: Pid) {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut pids = self.pids.lock();
        if let Some(pos) = pids.iter().skip(1).position(|p| *p == pid) {
            pids.remove(pos + 1);
        }
    }

    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn read(&self, dst: &mut [u8], timeout: Duration) -> Result<ReadOutcome> {
        if !self.is_running() {
            return self.wait_empty(timeout);
        }
        if self.overrun_pending.swap(false, Ordering::SeqCst) {
            return Ok(ReadOutcome::Overrun);
        }

        let mut gen = self.generator.lock();
        if let Some(limit) = self.config.fail_after_reads {
            if gen.data_reads >= limit {
                return Err(EngineError::SourceFailed("mock read failure".to_string()));
            }
        }

        let remaining = match self.config.total {
            Some(total) => total.saturating_sub(gen.delivered.len()),
            None => usize::MAX,
        };
        let n = dst.len().min(self.config.chunk_size).min(remaining);
        if n == 0 {
            drop(gen);
            return self.wait_empty(timeout);
        }

        gen.rng.fill_bytes(&mut dst[..n]);
        gen.delivered.extend_from_slice(&dst[..n]);
        gen.data_reads += 1;
        drop(gen);

        if !self.config.read_delay.is_zero() {
            std::thread::sleep(self.config.read_delay);
        }

        Ok(ReadOutcome::Data(n))
    }

    fn current_pids(&self) -> Vec<Pid> {
        self.pids.lock().clone()
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.opened.store(false, Ordering::SeqCst);
        self.pids.lock().clear();
    }
}

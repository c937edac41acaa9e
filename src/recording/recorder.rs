// src/recording/recorder.rs
//! Record engine and its loop thread
//!
//! [`RecordEngine::start`] attaches the source, spawns one loop thread per
//! session and returns a [`RecordSession`] handle. The loop owns the
//! staging buffer and the persister; each cycle it
//!
//! 1. reads from the source into the free tail of the buffer (or, with the
//!    buffer full, records the overflow condition instead),
//! 2. polls the outstanding write and compacts the buffer on completion,
//! 3. submits everything buffered if no write is outstanding.
//!
//! On stop it stops the source and drains the buffer before exiting.

use crate::recording::persister::{FilePersister, Persister, WriteStatus};
use crate::recording::pids::ensure_pid;
use crate::recording::session::RecordSession;
use crate::recording::staging::StagingBuffer;
use crate::recording::state::{RecordState, SharedState};
use crate::source::{Pid, ReadOutcome, SourceReader};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use metrics::{counter, gauge};
use serde::Deserialize;
use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};
use ulid::Ulid;

/// Recorder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Staging buffer capacity (bytes)
    pub buffer_size: usize,

    /// Maximum bytes per source read; defaults to a sixteenth of the buffer
    pub read_chunk: Option<usize>,

    /// Longest a single source read may block (milliseconds)
    pub read_timeout_ms: u64,

    /// Sleep between polls while the buffer is full (milliseconds)
    pub poll_interval_ms: u64,

    /// Sleep between polls during the stop drain (milliseconds)
    pub drain_poll_interval_ms: u64,

    /// Kernel-side buffer requested from the source (bytes)
    pub source_buffer_hint: usize,

    /// Fail the session when one write stays pending this long (milliseconds)
    pub stall_timeout_ms: Option<u64>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 2 << 20,
            read_chunk: None,
            read_timeout_ms: 50,
            poll_interval_ms: 5,
            drain_poll_interval_ms: 50,
            source_buffer_hint: 2 << 20,
            stall_timeout_ms: None,
        }
    }
}

impl RecorderConfig {
    /// Effective read chunk size
    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk
            .unwrap_or(self.buffer_size / 16)
            .clamp(1, self.buffer_size.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(EngineError::ConfigError(
                "recorder.buffer_size must be positive".to_string(),
            ));
        }
        if let Some(chunk) = self.read_chunk {
            if chunk == 0 || chunk > self.buffer_size {
                return Err(EngineError::ConfigError(format!(
                    "recorder.read_chunk must be in 1..={}",
                    self.buffer_size
                )));
            }
        }
        if self.read_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "recorder.read_timeout_ms must be positive".to_string(),
            ));
        }
        if self.stall_timeout_ms == Some(0) {
            return Err(EngineError::ConfigError(
                "recorder.stall_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session factory
pub struct RecordEngine {
    config: RecorderConfig,
}

impl RecordEngine {
    /// Create a new record engine
    pub fn new(config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Engine configuration
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Start recording `source` into `file`
    ///
    /// `pids` are the secondary pids captured next to `primary_pid`. On error
    /// everything acquired so far is released and no session exists.
    pub fn start(
        &self,
        source: Arc<dyn SourceReader>,
        file: File,
        primary_pid: Pid,
        pids: &[Pid],
    ) -> Result<RecordSession> {
        let buffer = StagingBuffer::new(self.config.buffer_size)?;
        let persister = FilePersister::new(file)?;
        self.launch(buffer, source, Box::new(persister), primary_pid, pids)
    }

    /// Start recording `source` into an arbitrary persister
    pub fn start_with_persister(
        &self,
        source: Arc<dyn SourceReader>,
        persister: Box<dyn Persister>,
        primary_pid: Pid,
        pids: &[Pid],
    ) -> Result<RecordSession> {
        let buffer = StagingBuffer::new(self.config.buffer_size)?;
        self.launch(buffer, source, persister, primary_pid, pids)
    }

    fn launch(
        &self,
        buffer: StagingBuffer,
        source: Arc<dyn SourceReader>,
        persister: Box<dyn Persister>,
        primary_pid: Pid,
        pids: &[Pid],
    ) -> Result<RecordSession> {
        let id = Ulid::new();
        info!(
            "Starting session {}: primary pid 0x{:04x}, {} extra pids, buffer {} bytes",
            id,
            primary_pid,
            pids.len(),
            buffer.capacity()
        );

        source.open(self.config.source_buffer_hint)?;
        if let Err(e) = source.set_primary_pid(primary_pid) {
            error!("Failed to select primary pid 0x{:04x}: {}", primary_pid, e);
            source.close();
            return Err(e);
        }

        let mut skipped_pids = Vec::new();
        for pid in pids.iter().filter(|pid| **pid != primary_pid) {
            if let Err(e) = ensure_pid(source.as_ref(), *pid) {
                warn!("Failed to add pid 0x{:04x}, recording without it: {}", pid, e);
                if !skipped_pids.contains(pid) {
                    skipped_pids.push(*pid);
                }
            }
        }

        let shared = Arc::new(SharedState::new());
        let record_loop = RecordLoop {
            id,
            config: self.config.clone(),
            buffer,
            source: Arc::clone(&source),
            persister,
            shared: Arc::clone(&shared),
            overflow_cycles: 0,
            overrun_tolerated: false,
            submitted_at: None,
        };

        let handle = std::thread::Builder::new()
            .name("record-loop".to_string())
            .spawn(move || record_loop.run())
            .map_err(|e| {
                error!("Failed to spawn record loop: {}", e);
                source.close();
                EngineError::ThreadSpawnFailed(format!("record loop: {}", e))
            })?;

        Ok(RecordSession::new(
            id,
            Utc::now(),
            primary_pid,
            skipped_pids,
            shared,
            source,
            handle,
        ))
    }
}

/// What the loop thread hands back on exit
pub(crate) struct LoopExit {
    pub(crate) state: RecordState,
    pub(crate) persister: Box<dyn Persister>,
}

/// Loop thread state; everything here is owned by the loop thread
struct RecordLoop {
    id: Ulid,
    config: RecorderConfig,
    buffer: StagingBuffer,
    source: Arc<dyn SourceReader>,
    persister: Box<dyn Persister>,
    shared: Arc<SharedState>,
    overflow_cycles: u64,
    overrun_tolerated: bool,
    submitted_at: Option<Instant>,
}

impl RecordLoop {
    fn run(mut self) -> LoopExit {
        let span = info_span!("record", session = %self.id);
        let _enter = span.enter();
        info!("Record loop started");

        let state = match self.source.start() {
            Ok(()) => self.steady_state(),
            Err(e) => {
                error!("Failed to start source: {}", e);
                self.fail(RecordState::FailedRead)
            }
        };
        self.source.stop();

        let state = match state {
            RecordState::FailedFile | RecordState::FailedMemory => state,
            _ => self.drain(state),
        };
        let state = match state {
            RecordState::Running => RecordState::Stopped,
            state => state,
        };

        info!(
            "Record loop finished ({:?}), {} bytes written",
            state,
            self.shared.bytes_written.load(Ordering::Relaxed)
        );

        LoopExit {
            state,
            persister: self.persister,
        }
    }

    /// Ingest until a stop is requested or something fatal happens
    fn steady_state(&mut self) -> RecordState {
        let chunk = self.config.read_chunk_size();
        let timeout = self.config.read_timeout();

        while !self.shared.stop_requested() {
            if !self.buffer.is_full() {
                if self.overflow_cycles > 0 {
                    info!("Overflow cleared after {} cycles", self.overflow_cycles);
                    self.overflow_cycles = 0;
                    self.shared.end_overflow();
                }

                let outcome = self.source.read(self.buffer.spare(chunk), timeout);
                match outcome {
                    Ok(ReadOutcome::Data(n)) => {
                        self.buffer.commit(n);
                        self.overrun_tolerated = false;
                        self.shared.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        counter!("tsrec_bytes_read_total").increment(n as u64);
                        debug!("Read {} bytes, {} buffered", n, self.buffer.filled());
                    }
                    Ok(ReadOutcome::Empty) => {}
                    Ok(ReadOutcome::Overrun) if self.overrun_tolerated => {
                        debug!("Source overrun after buffer overflow, continuing");
                    }
                    Ok(ReadOutcome::Overrun) => {
                        error!("Source overrun");
                        return self.fail(RecordState::FailedRead);
                    }
                    Err(e) => {
                        error!("Read failed: {}", e);
                        return self.fail(e.state_on_failure());
                    }
                }
            } else {
                if self.overflow_cycles == 0 {
                    self.shared.begin_overflow();
                    counter!("tsrec_overflow_events_total").increment(1);
                }
                if self.overflow_cycles % 10 == 0 {
                    warn!(
                        "Buffer full, writes not keeping up ({} cycles)",
                        self.overflow_cycles + 1
                    );
                }
                self.overflow_cycles += 1;
                self.overrun_tolerated = true;
            }

            if let Err(state) = self.collect_write() {
                return self.fail(state);
            }
            if let Err(state) = self.submit_buffered() {
                return self.fail(state);
            }

            let fill = self.buffer.filled();
            self.shared.buffer_fill.store(fill, Ordering::Relaxed);
            gauge!("tsrec_buffer_fill_bytes").set(fill as f64);

            // Nothing can move until the write completes
            if self.buffer.is_full() && self.persister.is_pending() {
                std::thread::sleep(self.config.poll_interval());
            }
        }

        RecordState::Running
    }

    /// Flush whatever is buffered; the source is already stopped
    fn drain(&mut self, state: RecordState) -> RecordState {
        let interval = self.config.drain_poll_interval();
        debug!("Draining {} buffered bytes", self.buffer.filled());

        loop {
            if let Err(failed) = self.collect_write() {
                return self.fail(failed);
            }
            if self.persister.is_pending() {
                std::thread::sleep(interval);
                continue;
            }
            if self.buffer.is_empty() {
                break;
            }
            if let Err(failed) = self.submit_buffered() {
                return self.fail(failed);
            }
        }

        self.shared.buffer_fill.store(0, Ordering::Relaxed);
        self.shared.end_overflow();
        state
    }

    /// Poll the outstanding write and account for its completion
    fn collect_write(&mut self) -> std::result::Result<(), RecordState> {
        match self.persister.poll() {
            WriteStatus::Idle => Ok(()),
            WriteStatus::Pending => self.check_stall(),
            WriteStatus::Completed(n) => {
                self.buffer.complete_drain(n);
                self.submitted_at = None;
                self.shared.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                self.shared.writes.fetch_add(1, Ordering::Relaxed);
                counter!("tsrec_bytes_written_total").increment(n as u64);
                counter!("tsrec_writes_total").increment(1);
                debug!("Wrote {} bytes, {} left", n, self.buffer.filled());
                Ok(())
            }
            WriteStatus::Failed(e) => {
                error!("Write failed: {}", e);
                Err(RecordState::FailedFile)
            }
        }
    }

    /// Hand everything buffered to the persister if it is idle
    fn submit_buffered(&mut self) -> std::result::Result<(), RecordState> {
        if self.persister.is_pending() || self.buffer.is_empty() {
            return Ok(());
        }

        let data = self.buffer.begin_drain();
        if let Err(e) = self.persister.submit(data) {
            self.buffer.complete_drain(0);
            error!("Failed to submit write: {}", e);
            return Err(e.state_on_failure());
        }
        self.submitted_at = Some(Instant::now());
        Ok(())
    }

    fn check_stall(&self) -> std::result::Result<(), RecordState> {
        if let (Some(limit), Some(since)) = (self.config.stall_timeout(), self.submitted_at) {
            let elapsed = since.elapsed();
            if elapsed > limit {
                error!("Write pending for {:?}, giving up", elapsed);
                return Err(RecordState::FailedFile);
            }
        }
        Ok(())
    }

    fn fail(&self, state: RecordState) -> RecordState {
        self.shared.set_state(state);
        state
    }
}

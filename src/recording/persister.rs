// src/recording/persister.rs
//! Asynchronous append writer
//!
//! A [`Persister`] accepts one write at a time and reports its completion
//! through a non-blocking [`poll`](Persister::poll). The record loop never
//! waits on a write in the steady state; it keeps servicing the source and
//! polls again on the next cycle.
//!
//! - **FilePersister**: appends to a file from a dedicated writer thread
//! - **MemoryPersister**: in-memory sink with scripted latency, for tests

use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// State of the outstanding write
#[derive(Debug)]
pub enum WriteStatus {
    /// Nothing submitted
    Idle,

    /// Submitted, not finished yet
    Pending,

    /// Finished; this many bytes reached the destination
    Completed(usize),

    /// Finished with an error; the destination is unusable
    Failed(EngineError),
}

/// Single-outstanding-write sink
pub trait Persister: Send {
    /// Start writing `data`. Fails with [`EngineError::WriteInFlight`] if the
    /// previous write has not been collected by [`poll`](Self::poll).
    fn submit(&mut self, data: &[u8]) -> Result<()>;

    /// Non-blocking completion check
    fn poll(&mut self) -> WriteStatus;

    /// True between `submit` and the poll that reports its outcome
    fn is_pending(&self) -> bool;

    /// Release the destination
    fn close(&mut self) -> Result<()>;
}

/// Set `O_APPEND` on the descriptor if the caller did not
fn ensure_append(file: &File) {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let fd = file.as_raw_fd();
    match fcntl(fd, FcntlArg::F_GETFL) {
        Ok(bits) => {
            let flags = OFlag::from_bits_truncate(bits);
            if !flags.contains(OFlag::O_APPEND) {
                if let Err(e) = fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_APPEND)) {
                    warn!("Failed to set O_APPEND: {}", e);
                }
            }
        }
        Err(e) => warn!("Failed to read file flags: {}", e),
    }
}

/// Tell the kernel the written data need not stay in the page cache
#[cfg(target_os = "linux")]
fn advise_dontneed(file: &File) {
    use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};

    if let Err(e) = posix_fadvise(
        file.as_raw_fd(),
        0,
        0,
        PosixFadviseAdvice::POSIX_FADV_DONTNEED,
    ) {
        debug!("posix_fadvise failed: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_dontneed(_file: &File) {}

struct Completion {
    buf: Vec<u8>,
    result: std::io::Result<usize>,
}

/// Appends to a file from a writer thread
///
/// `submit` copies the range into a recycled buffer and hands it to the
/// writer, so the caller's staging memory is free again immediately.
pub struct FilePersister {
    jobs: Option<Sender<Vec<u8>>>,
    completions: Receiver<Completion>,
    worker: Option<JoinHandle<()>>,
    spare: Vec<u8>,
    pending: bool,
}

impl FilePersister {
    /// Take ownership of `file` and start the writer thread
    pub fn new(file: File) -> Result<Self> {
        ensure_append(&file);
        advise_dontneed(&file);

        let (job_tx, job_rx) = bounded::<Vec<u8>>(1);
        let (done_tx, done_rx) = bounded::<Completion>(1);

        let worker = std::thread::Builder::new()
            .name("record-writer".to_string())
            .spawn(move || Self::writer_loop(file, job_rx, done_tx))
            .map_err(|e| EngineError::ThreadSpawnFailed(format!("writer thread: {}", e)))?;

        Ok(Self {
            jobs: Some(job_tx),
            completions: done_rx,
            worker: Some(worker),
            spare: Vec::new(),
            pending: false,
        })
    }

    fn writer_loop(mut file: File, jobs: Receiver<Vec<u8>>, done: Sender<Completion>) {
        for buf in jobs.iter() {
            let result = file.write_all(&buf).map(|_| buf.len());
            if result.is_ok() {
                advise_dontneed(&file);
            }
            if done.send(Completion { buf, result }).is_err() {
                break;
            }
        }
        debug!("Writer thread finished");
        // `file` is closed here
    }
}

impl Persister for FilePersister {
    fn submit(&mut self, data: &[u8]) -> Result<()> {
        if self.pending {
            return Err(EngineError::WriteInFlight);
        }
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| EngineError::StorageFailed("persister is closed".to_string()))?;

        let mut buf = std::mem::take(&mut self.spare);
        buf.clear();
        buf.try_reserve(data.len()).map_err(|e| {
            EngineError::OutOfMemory(format!("write buffer of {} bytes: {}", data.len(), e))
        })?;
        buf.extend_from_slice(data);

        jobs.send(buf)
            .map_err(|_| EngineError::StorageFailed("writer thread exited".to_string()))?;
        self.pending = true;
        Ok(())
    }

    fn poll(&mut self) -> WriteStatus {
        if !self.pending {
            return WriteStatus::Idle;
        }

        match self.completions.try_recv() {
            Ok(Completion { buf, result }) => {
                self.pending = false;
                self.spare = buf;
                match result {
                    Ok(n) => WriteStatus::Completed(n),
                    Err(e) => {
                        error!("Write failed: {}", e);
                        WriteStatus::Failed(EngineError::StorageFailed(format!(
                            "write failed: {}",
                            e
                        )))
                    }
                }
            }
            Err(TryRecvError::Empty) => WriteStatus::Pending,
            Err(TryRecvError::Disconnected) => {
                self.pending = false;
                WriteStatus::Failed(EngineError::StorageFailed(
                    "writer thread exited".to_string(),
                ))
            }
        }
    }

    fn is_pending(&self) -> bool {
        self.pending
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the writer loop
        self.jobs = None;

        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        if self.pending {
            // A stuck write would block the join; the thread closes the file
            // once the write returns
            warn!("Closing with a write still in flight, detaching writer thread");
            return Ok(());
        }

        worker
            .join()
            .map_err(|_| EngineError::StorageFailed("writer thread panicked".to_string()))
    }
}

impl Drop for FilePersister {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MemoryShared {
    contents: Mutex<Vec<u8>>,
    stalled: AtomicBool,
    fail_next: AtomicBool,
    closed: AtomicBool,
    writes: AtomicU64,
}

/// Observer and fault injector for a [`MemoryPersister`]
#[derive(Clone)]
pub struct MemoryPersisterHandle {
    shared: Arc<MemoryShared>,
}

impl MemoryPersisterHandle {
    /// Everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.shared.contents.lock().clone()
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.shared.contents.lock().len()
    }

    /// True when nothing was written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completed writes
    pub fn writes(&self) -> u64 {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Hold (or release) completion of the in-flight write
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Make the next write fail
    pub fn fail_next_write(&self) {
        self.shared.fail_next.store(true, Ordering::SeqCst);
    }

    /// True once the engine released the persister
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// How long a [`MemoryPersister`] write stays pending
#[derive(Debug, Clone, Copy)]
enum Latency {
    /// Fixed number of polls regardless of size
    Polls(u32),

    /// One poll per this many bytes, rounded up
    BytesPerPoll(usize),
}

/// In-memory persister with scripted write latency
pub struct MemoryPersister {
    shared: Arc<MemoryShared>,
    latency: Latency,
    in_flight: Option<(Vec<u8>, u32)>,
}

impl MemoryPersister {
    /// Writes complete on the `latency_polls + 1`-th poll after submit
    pub fn new(latency_polls: u32) -> (Self, MemoryPersisterHandle) {
        Self::with_latency(Latency::Polls(latency_polls))
    }

    /// Writes absorb `bytes_per_poll` bytes per poll, so a write of `n` bytes
    /// completes on poll `ceil(n / bytes_per_poll)`
    pub fn with_throughput(bytes_per_poll: usize) -> (Self, MemoryPersisterHandle) {
        Self::with_latency(Latency::BytesPerPoll(bytes_per_poll.max(1)))
    }

    fn with_latency(latency: Latency) -> (Self, MemoryPersisterHandle) {
        let shared = Arc::new(MemoryShared {
            contents: Mutex::new(Vec::new()),
            stalled: AtomicBool::new(false),
            fail_next: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        });

        let persister = Self {
            shared: Arc::clone(&shared),
            latency,
            in_flight: None,
        };
        (persister, MemoryPersisterHandle { shared })
    }

    /// Persister completing on the first poll
    pub fn instant() -> (Self, MemoryPersisterHandle) {
        Self::new(0)
    }
}

impl Persister for MemoryPersister {
    fn submit(&mut self, data: &[u8]) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(EngineError::WriteInFlight);
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::StorageFailed("persister is closed".to_string()));
        }
        let pending_polls = match self.latency {
            Latency::Polls(polls) => polls,
            Latency::BytesPerPoll(rate) => {
                let polls = data.len().div_ceil(rate).saturating_sub(1);
                u32::try_from(polls).unwrap_or(u32::MAX)
            }
        };
        self.in_flight = Some((data.to_vec(), pending_polls));
        Ok(())
    }

    fn poll(&mut self) -> WriteStatus {
        let Some((_, remaining)) = self.in_flight.as_mut() else {
            return WriteStatus::Idle;
        };
        if self.shared.stalled.load(Ordering::SeqCst) {
            return WriteStatus::Pending;
        }
        if *remaining > 0 {
            *remaining -= 1;
            return WriteStatus::Pending;
        }

        let Some((data, _)) = self.in_flight.take() else {
            return WriteStatus::Idle;
        };
        if self.shared.fail_next.swap(false, Ordering::SeqCst) {
            return WriteStatus::Failed(EngineError::StorageFailed(
                "injected write failure".to_string(),
            ));
        }

        self.shared.contents.lock().extend_from_slice(&data);
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        WriteStatus::Completed(data.len())
    }

    fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    fn close(&mut self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// src/source/stream.rs
//! Source reading from a DVR device node, FIFO or file
//!
//! The descriptor is opened non-blocking and every read waits in `poll(2)`
//! for at most the caller's timeout. A DVR device reports a ring overflow
//! with `EOVERFLOW`, which surfaces as [`ReadOutcome::Overrun`].
//!
//! Pid selection is kept as a table only; programming the hardware section
//! filters is the demux driver's job. The pid table and the descriptor sit
//! behind separate locks, and a read waits in `poll(2)` without holding
//! either, so pid changes never queue behind the loop.

use crate::source::{Pid, ReadOutcome, SourceReader};
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Byte source backed by a file descriptor
pub struct StreamSource {
    path: PathBuf,
    file: Mutex<Option<Arc<File>>>,
    pids: Mutex<Vec<Pid>>,
    opened: AtomicBool,
    running: AtomicBool,
}

impl StreamSource {
    /// Create a source for `path`; nothing is opened until [`SourceReader::open`]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
            pids: Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// True between `open` and `close`
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Device path
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(target_os = "linux")]
    fn apply_buffer_hint(file: &File, buffer_hint: usize) {
        use nix::fcntl::{fcntl, FcntlArg};

        let size = buffer_hint.min(i32::MAX as usize) as libc::c_int;
        match fcntl(file.as_raw_fd(), FcntlArg::F_SETPIPE_SZ(size)) {
            Ok(actual) => debug!("Pipe buffer set to {} bytes", actual),
            // Not a pipe; device nodes size their ring through the driver
            Err(e) => debug!("Buffer hint of {} bytes not applied: {}", buffer_hint, e),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_buffer_hint(_file: &File, buffer_hint: usize) {
        debug!("Buffer hint of {} bytes ignored on this platform", buffer_hint);
    }

    /// Wait until the descriptor is readable; `false` on timeout
    fn wait_readable(file: &File, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a valid pollfd for the duration of the call
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(EngineError::SourceFailed(format!("poll failed: {}", err)));
        }

        Ok(rc > 0)
    }
}

impl SourceReader for StreamSource {
    fn open(&self, buffer_hint: usize) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| {
                EngineError::SourceFailed(format!("Failed to open {:?}: {}", self.path, e))
            })?;

        Self::apply_buffer_hint(&file, buffer_hint);

        info!("Opened stream source {:?}", self.path);
        *self.file.lock() = Some(Arc::new(file));
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_primary_pid(&self, pid: Pid) -> Result<()> {
        let mut pids = self.pids.lock();
        pids.retain(|p| *p != pid);
        pids.insert(0, pid);
        debug!("Primary pid 0x{:04x}", pid);
        Ok(())
    }

    fn add_pid(&self, pid: Pid) -> Result<()> {
        if !self.is_open() {
            return Err(EngineError::SourceFailed(format!(
                "Cannot add pid 0x{:04x}: {:?} is not open",
                pid, self.path
            )));
        }
        self.pids.lock().push(pid);
        debug!("Added pid 0x{:04x}", pid);
        Ok(())
    }

    fn remove_pid(&self, pid: Pid) {
        let mut pids = self.pids.lock();
        match pids.iter().skip(1).position(|p| *p == pid) {
            Some(pos) => {
                pids.remove(pos + 1);
                debug!("Removed pid 0x{:04x}", pid);
            }
            None => warn!("Pid 0x{:04x} not selected", pid),
        }
    }

    fn start(&self) -> Result<()> {
        if !self.is_open() {
            return Err(EngineError::SourceFailed(format!("{:?} is not open", self.path)));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn read(&self, dst: &mut [u8], timeout: Duration) -> Result<ReadOutcome> {
        let file = self
            .file
            .lock()
            .clone()
            .ok_or_else(|| EngineError::SourceFailed(format!("{:?} is not open", self.path)))?;

        if !self.running.load(Ordering::SeqCst) || !Self::wait_readable(&file, timeout)? {
            return Ok(ReadOutcome::Empty);
        }

        match (&*file).read(dst) {
            Ok(0) => {
                // EOF on a file or a FIFO without writer; poll keeps reporting
                // readable, so pace the caller here
                std::thread::sleep(timeout);
                Ok(ReadOutcome::Empty)
            }
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(ReadOutcome::Empty)
            }
            Err(e) if e.raw_os_error() == Some(libc::EOVERFLOW) => Ok(ReadOutcome::Overrun),
            Err(e) => Err(EngineError::SourceFailed(format!(
                "Read from {:?} failed: {}",
                self.path, e
            ))),
        }
    }

    fn current_pids(&self) -> Vec<Pid> {
        self.pids.lock().clone()
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.opened.store(false, Ordering::SeqCst);
        self.pids.lock().clear();
        if self.file.lock().take().is_some() {
            info!("Closed stream source {:?}", self.path);
        }
    }
}

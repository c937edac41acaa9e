// src/recording/session.rs
//! Caller-side handle of a running recording
//!
//! Owns the loop thread's join handle and the source attachment. Pid
//! changes go straight to the source under the attachment lock, which
//! serializes them with each other but not with the loop.

use crate::recording::pids::{ensure_pid, reconcile, secondary_pids, PidDiff};
use crate::recording::recorder::LoopExit;
use crate::recording::state::{RecordState, RecordStatus, SharedState};
use crate::source::{Pid, SourceReader};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};
use ulid::Ulid;

/// Live counters of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: RecordState,
    pub status: RecordStatus,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub writes: u64,
    pub overflow_episodes: u64,
    pub buffer_fill: usize,

    /// Requested pids the source refused at start
    pub skipped_pids: Vec<Pid>,
}

/// Summary produced when a session stops
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: Ulid,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,

    /// State the loop ended in; `Stopped` for a clean stop
    pub final_state: RecordState,

    pub bytes_read: u64,
    pub bytes_written: u64,
    pub writes: u64,
    pub overflow_episodes: u64,
}

/// Handle of one recording, returned by [`RecordEngine::start`](crate::recording::RecordEngine::start)
///
/// Dropping the handle stops the session.
pub struct RecordSession {
    id: Ulid,
    started_at: DateTime<Utc>,
    primary_pid: Pid,
    skipped_pids: Vec<Pid>,
    shared: Arc<SharedState>,
    source: Mutex<Option<Arc<dyn SourceReader>>>,
    worker: Option<JoinHandle<LoopExit>>,
    report: Option<SessionReport>,
}

impl RecordSession {
    pub(crate) fn new(
        id: Ulid,
        started_at: DateTime<Utc>,
        primary_pid: Pid,
        skipped_pids: Vec<Pid>,
        shared: Arc<SharedState>,
        source: Arc<dyn SourceReader>,
        worker: JoinHandle<LoopExit>,
    ) -> Self {
        Self {
            id,
            started_at,
            primary_pid,
            skipped_pids,
            shared,
            source: Mutex::new(Some(source)),
            worker: Some(worker),
            report: None,
        }
    }

    /// Session id
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn primary_pid(&self) -> Pid {
        self.primary_pid
    }

    /// Pids requested at start that the source did not accept
    ///
    /// Recording runs without them; a later [`add_pid`](Self::add_pid) may retry.
    pub fn skipped_pids(&self) -> &[Pid] {
        &self.skipped_pids
    }

    /// Current state; `FailedOverflow` while the buffer is full
    pub fn state(&self) -> RecordState {
        self.shared.visible_state()
    }

    /// Caller-visible status
    pub fn status(&self) -> RecordStatus {
        self.shared.status()
    }

    /// Acknowledge an earlier overflow: clears a latched `Slow`
    ///
    /// An overflow in progress or a failed session keeps reporting `Overflow`.
    pub fn reset_status(&self) {
        debug!("Resetting status of session {}", self.id);
        self.shared.reset_slow();
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            status: self.status(),
            bytes_read: self.shared.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            writes: self.shared.writes.load(Ordering::Relaxed),
            overflow_episodes: self.shared.overflow_episodes.load(Ordering::Relaxed),
            buffer_fill: self.shared.buffer_fill.load(Ordering::Relaxed),
            skipped_pids: self.skipped_pids.clone(),
        }
    }

    /// Pids selected on the source, primary first; empty once detached
    pub fn active_pids(&self) -> Vec<Pid> {
        match self.source.lock().as_ref() {
            Some(source) => source.current_pids(),
            None => Vec::new(),
        }
    }

    /// Add `pid` to the selection; no-op if already selected
    pub fn add_pid(&self, pid: Pid) -> Result<()> {
        let guard = self.source.lock();
        let source = guard.as_ref().ok_or(EngineError::SourceDetached)?;
        if ensure_pid(source.as_ref(), pid)? {
            info!("Added pid 0x{:04x}", pid);
        }
        Ok(())
    }

    /// Replace the secondary pids with `pids`
    pub fn change_pids(&self, pids: &[Pid]) -> Result<PidDiff> {
        let guard = self.source.lock();
        let source = guard.as_ref().ok_or(EngineError::SourceDetached)?;
        let diff = reconcile(source.as_ref(), self.primary_pid, pids)?;
        if !diff.is_empty() {
            info!(
                "Pids changed: -{:?} +{:?}, now {:?}",
                diff.remove,
                diff.add,
                secondary_pids(source.as_ref())
            );
        }
        Ok(diff)
    }

    /// Stop recording
    ///
    /// Waits for the loop to flush the buffer, closes the destination and
    /// closes the source, which drops its pid selection. Safe in any state;
    /// later calls return the same report.
    pub fn stop(&mut self) -> Result<SessionReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }

        info!("Stopping session {}", self.id);
        self.shared.request_stop();

        let final_state = match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(LoopExit {
                    state,
                    mut persister,
                }) => match persister.close() {
                    Ok(()) => state,
                    Err(e) => {
                        error!("Failed to close destination: {}", e);
                        if state.is_fatal() {
                            state
                        } else {
                            RecordState::FailedFile
                        }
                    }
                },
                Err(_) => {
                    error!("Record loop panicked");
                    RecordState::FailedFile
                }
            },
            None => self.shared.state(),
        };

        if let Some(source) = self.source.lock().take() {
            source.close();
        }
        self.shared.set_state(RecordState::Stopped);
        self.shared.buffer_fill.store(0, Ordering::Relaxed);

        let report = SessionReport {
            id: self.id,
            started_at: self.started_at,
            stopped_at: Utc::now(),
            final_state,
            bytes_read: self.shared.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            writes: self.shared.writes.load(Ordering::Relaxed),
            overflow_episodes: self.shared.overflow_episodes.load(Ordering::Relaxed),
        };
        info!(
            "Session {} stopped ({:?}): {} bytes read, {} written",
            self.id, report.final_state, report.bytes_read, report.bytes_written
        );

        self.report = Some(report.clone());
        Ok(report)
    }

    /// Report of a stopped session
    pub fn report(&self) -> Option<&SessionReport> {
        self.report.as_ref()
    }
}

impl Drop for RecordSession {
    fn drop(&mut self) {
        if self.report.is_none() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::recording::persister::MemoryPersister;
    use crate::recording::recorder::{RecordEngine, RecorderConfig};
    use crate::recording::state::{RecordState, RecordStatus};
    use crate::source::{MockSource, SourceReader};
    use crate::utils::errors::EngineError;
    use std::sync::Arc;

    fn engine() -> RecordEngine {
        RecordEngine::new(RecorderConfig {
            buffer_size: 16 * 1024,
            read_chunk: Some(1024),
            read_timeout_ms: 2,
            poll_interval_ms: 1,
            drain_poll_interval_ms: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_pid_operations() {
        let source = Arc::new(MockSource::endless(188));
        let (persister, _handle) = MemoryPersister::instant();
        let mut session = engine()
            .start_with_persister(source.clone(), Box::new(persister), 0x100, &[0x101])
            .unwrap();

        session.add_pid(0x102).unwrap();
        let adds = source.add_calls();
        session.add_pid(0x102).unwrap();
        assert_eq!(source.add_calls(), adds);
        assert_eq!(session.active_pids(), vec![0x100, 0x101, 0x102]);

        let diff = session.change_pids(&[0x102, 0x103]).unwrap();
        assert_eq!(diff.remove, vec![0x101]);
        assert_eq!(diff.add, vec![0x103]);
        assert!(session.change_pids(&[0x102, 0x103]).unwrap().is_empty());
        assert_eq!(source.current_pids(), vec![0x100, 0x102, 0x103]);

        session.stop().unwrap();
        assert!(matches!(
            session.add_pid(0x104),
            Err(EngineError::SourceDetached)
        ));
        assert!(matches!(
            session.change_pids(&[]),
            Err(EngineError::SourceDetached)
        ));
        assert!(session.active_pids().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let source = Arc::new(MockSource::endless(188));
        let (persister, handle) = MemoryPersister::instant();
        let mut session = engine()
            .start_with_persister(source.clone(), Box::new(persister), 0x100, &[])
            .unwrap();

        let first = session.stop().unwrap();
        let second = session.stop().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.bytes_written, second.bytes_written);
        assert_eq!(session.state(), RecordState::Stopped);
        assert_eq!(session.status(), RecordStatus::Ok);
        assert!(handle.is_closed());
        assert!(!source.is_running());
        assert!(!source.is_open());
        assert!(source.current_pids().is_empty());
    }

    #[test]
    fn test_second_session_starts_from_requested_pids() {
        let source = Arc::new(MockSource::endless(188));

        let (persister, _first) = MemoryPersister::instant();
        let mut session = engine()
            .start_with_persister(source.clone(), Box::new(persister), 0x100, &[0x101])
            .unwrap();
        session.add_pid(0x103).unwrap();
        assert_eq!(session.active_pids(), vec![0x100, 0x101, 0x103]);
        session.stop().unwrap();
        assert!(source.current_pids().is_empty());

        let (persister, second) = MemoryPersister::instant();
        let mut session = engine()
            .start_with_persister(source.clone(), Box::new(persister), 0x100, &[0x102])
            .unwrap();
        assert_eq!(session.active_pids(), vec![0x100, 0x102]);
        assert_eq!(source.current_pids(), vec![0x100, 0x102]);

        session.stop().unwrap();
        assert!(!source.is_open());
        assert!(second.is_closed());
    }

    #[test]
    fn test_drop_stops_session() {
        let source = Arc::new(MockSource::endless(188));
        let (persister, handle) = MemoryPersister::instant();
        let session = engine()
            .start_with_persister(source.clone(), Box::new(persister), 0x100, &[])
            .unwrap();

        drop(session);
        assert!(handle.is_closed());
        assert_eq!(handle.contents(), source.delivered());
    }

    #[test]
    fn test_stats_snapshot() {
        let source = Arc::new(MockSource::finite(1024, 8 * 1024));
        let (persister, _handle) = MemoryPersister::instant();
        let mut session = engine()
            .start_with_persister(source.clone(), Box::new(persister), 0x100, &[])
            .unwrap();

        let report = session.stop().unwrap();
        let stats = session.stats();
        assert_eq!(stats.state, RecordState::Stopped);
        assert_eq!(stats.bytes_written, report.bytes_written);
        assert_eq!(stats.bytes_read, source.delivered_len() as u64);
        assert_eq!(stats.buffer_fill, 0);
    }
}
